//! In-memory implementation of the export request store.
//!
//! Used by tests and by deployments that run without a database. All writes
//! take one lock, which gives the same per-source serialization the
//! PostgreSQL row lock provides.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use domain::models::{
    ExportFilter, ExportRequest, ExportSource, NewExportRequest, Owner, RequestStatus,
    SortField, SourceError, SourceStatus, DEFAULT_EXPIRY_DAYS,
};
use shared::pagination::Page;

use crate::metrics::QueryTimer;
use crate::store::{
    check_source_transition, validate_new_request, ExpiredExport, ExportStore, StoreError,
};

/// Clock that follows system time until pinned.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    pinned: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ManualClock {
    pub fn now(&self) -> DateTime<Utc> {
        let pinned = self.pinned.lock().unwrap_or_else(|p| p.into_inner());
        pinned.unwrap_or_else(Utc::now)
    }

    /// Pins the clock to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.pinned.lock().unwrap_or_else(|p| p.into_inner()) = Some(time);
    }

    /// Moves the clock forward, pinning it first if necessary.
    pub fn advance(&self, by: Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

/// Export store held entirely in process memory.
#[derive(Default)]
pub struct MemoryExportStore {
    requests: RwLock<HashMap<Uuid, ExportRequest>>,
    clock: ManualClock,
}

impl MemoryExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }
}

fn owned_by(request: &ExportRequest, owner: &Owner) -> bool {
    request.owner == *owner
}

fn matches_filter(request: &ExportRequest, filter: &ExportFilter) -> bool {
    if let Some(name) = &filter.name {
        if !request.name.to_lowercase().contains(&name.to_lowercase()) {
            return false;
        }
    }
    if let Some(application) = &filter.application {
        if !request.sources.iter().any(|s| &s.application == application) {
            return false;
        }
    }
    if let Some(resource) = &filter.resource {
        if !request.sources.iter().any(|s| &s.resource == resource) {
            return false;
        }
    }
    if let Some(created) = filter.created {
        if request.created_at.date_naive() != created {
            return false;
        }
    }
    if let Some(expires) = filter.expires {
        if request.expires_at.map(|e| e.date_naive()) != Some(expires) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if request.status != status {
            return false;
        }
    }
    true
}

fn compare_field(a: &ExportRequest, b: &ExportRequest, field: SortField) -> Ordering {
    fn min_of<'a>(sources: &'a [ExportSource], f: fn(&ExportSource) -> &str) -> Option<&'a str> {
        sources.iter().map(f).min()
    }

    match field {
        SortField::Name => a.name.cmp(&b.name),
        SortField::Created => a.created_at.cmp(&b.created_at),
        SortField::Expires => a.expires_at.cmp(&b.expires_at),
        SortField::Application => min_of(&a.sources, |s| s.application.as_str())
            .cmp(&min_of(&b.sources, |s| s.application.as_str())),
        SortField::Resource => min_of(&a.sources, |s| s.resource.as_str())
            .cmp(&min_of(&b.sources, |s| s.resource.as_str())),
    }
}

fn compare_requests(a: &ExportRequest, b: &ExportRequest, filter: &ExportFilter) -> Ordering {
    for key in &filter.sort {
        let ord = compare_field(a, b, key.field);
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl ExportStore for MemoryExportStore {
    async fn create(&self, new: NewExportRequest) -> Result<ExportRequest, StoreError> {
        let timer = QueryTimer::memory("create_export_request");
        let now = self.clock.now();
        validate_new_request(&new, now)?;

        let request = ExportRequest {
            id: Uuid::new_v4(),
            owner: new.owner,
            name: new.name,
            format: new.format,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: Some(
                new.expires_at
                    .unwrap_or(now + Duration::days(DEFAULT_EXPIRY_DAYS)),
            ),
            archive_key: None,
            sources: new
                .sources
                .into_iter()
                .map(|s| ExportSource {
                    id: Uuid::new_v4(),
                    application: s.application,
                    resource: s.resource,
                    filters: s.filters,
                    status: SourceStatus::Pending,
                    error: None,
                })
                .collect(),
        };

        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(timer.observe(request))
    }

    async fn get(&self, id: Uuid) -> Result<ExportRequest, StoreError> {
        let timer = QueryTimer::memory("get_export_request");
        let requests = self.requests.read().await;
        timer.observe(requests.get(&id).cloned().ok_or(StoreError::NotFound))
    }

    async fn get_for_owner(&self, id: Uuid, owner: &Owner) -> Result<ExportRequest, StoreError> {
        let timer = QueryTimer::memory("get_export_request_for_owner");
        let requests = self.requests.read().await;
        timer.observe(
            requests
                .get(&id)
                .filter(|r| owned_by(r, owner))
                .cloned()
                .ok_or(StoreError::NotFound),
        )
    }

    async fn list(
        &self,
        owner: &Owner,
        filter: &ExportFilter,
        page: Page,
    ) -> Result<(i64, Vec<ExportRequest>), StoreError> {
        let timer = QueryTimer::memory("list_export_requests");
        let requests = self.requests.read().await;

        let mut matching: Vec<&ExportRequest> = requests
            .values()
            .filter(|r| owned_by(r, owner) && matches_filter(r, filter))
            .collect();
        matching.sort_by(|a, b| compare_requests(a, b, filter));

        let count = matching.len() as i64;
        let data = matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .cloned()
            .collect();

        Ok(timer.observe((count, data)))
    }

    async fn delete(&self, id: Uuid, owner: &Owner) -> Result<(), StoreError> {
        let timer = QueryTimer::memory("delete_export_request");
        let mut requests = self.requests.write().await;
        match requests.get(&id) {
            Some(r) if owned_by(r, owner) => {
                requests.remove(&id);
                Ok(timer.observe(()))
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn update_source(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        status: SourceStatus,
        error: Option<SourceError>,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::memory("update_export_source");
        let now = self.clock.now();
        let mut requests = self.requests.write().await;

        let request = requests.get_mut(&request_id).ok_or(StoreError::NotFound)?;
        let source = request
            .sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or(StoreError::NotFound)?;

        check_source_transition(source.status, status)?;
        source.status = status;
        source.error = error;
        request.updated_at = now;

        Ok(timer.observe(()))
    }

    async fn start_request(&self, id: Uuid) -> Result<bool, StoreError> {
        let timer = QueryTimer::memory("start_export_request");
        let now = self.clock.now();
        let mut requests = self.requests.write().await;

        let request = requests.get_mut(&id).ok_or(StoreError::NotFound)?;
        if request.status != RequestStatus::Pending {
            return Ok(timer.observe(false));
        }
        request.status = RequestStatus::Running;
        request.updated_at = now;
        Ok(timer.observe(true))
    }

    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
        archive_key: Option<String>,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::memory("set_export_request_status");
        let now = self.clock.now();
        let mut requests = self.requests.write().await;

        let request = requests.get_mut(&id).ok_or(StoreError::NotFound)?;
        if archive_key.is_some() && request.archive_key.is_some() {
            return Err(StoreError::AlreadyTerminal);
        }

        request.status = status;
        if completed_at.is_some() {
            request.completed_at = completed_at;
        }
        if archive_key.is_some() {
            request.archive_key = archive_key;
        }
        request.updated_at = now;
        Ok(timer.observe(()))
    }

    async fn delete_expired(&self) -> Result<Vec<ExpiredExport>, StoreError> {
        let timer = QueryTimer::memory("delete_expired_export_requests");
        let now = self.clock.now();
        let mut requests = self.requests.write().await;

        let expired: Vec<Uuid> = requests
            .values()
            .filter(|r| r.expires_at.is_some_and(|e| e < now))
            .map(|r| r.id)
            .collect();
        let removed = expired
            .into_iter()
            .filter_map(|id| requests.remove(&id))
            .map(|r| ExpiredExport {
                id: r.id,
                organization_id: r.owner.organization_id,
                archive_key: r.archive_key,
            })
            .collect();
        Ok(timer.observe(removed))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domain::models::{NewExportSource, PayloadFormat, SortKey};
    use fake::faker::internet::en::Username;
    use fake::Fake;

    fn owner() -> Owner {
        Owner {
            account_id: "540155".into(),
            organization_id: "1979710".into(),
            username: Username().fake(),
        }
    }

    fn new_request(owner: &Owner, name: &str, apps: &[(&str, &str)]) -> NewExportRequest {
        NewExportRequest {
            owner: owner.clone(),
            name: name.to_string(),
            format: PayloadFormat::Json,
            expires_at: None,
            sources: apps
                .iter()
                .map(|(application, resource)| NewExportSource {
                    application: application.to_string(),
                    resource: resource.to_string(),
                    filters: serde_json::json!({}),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_default_expiry() {
        let store = MemoryExportStore::new();
        let owner = owner();
        let created = store
            .create(new_request(&owner, "a", &[("appA", "r1"), ("appB", "r2")]))
            .await
            .unwrap();

        assert_eq!(created.status, RequestStatus::Pending);
        assert_eq!(created.sources.len(), 2);
        assert_ne!(created.sources[0].id, created.sources[1].id);
        assert!(created.sources.iter().all(|s| s.status == SourceStatus::Pending));
        assert_eq!(
            created.expires_at,
            Some(created.created_at + Duration::days(DEFAULT_EXPIRY_DAYS))
        );
        assert_eq!(store.get(created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_sources() {
        let store = MemoryExportStore::new();
        let err = store
            .create(new_request(&owner(), "a", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let store = MemoryExportStore::new();
        let alice = owner();
        let mut mallory = alice.clone();
        mallory.username = format!("{}-other", alice.username);

        let created = store
            .create(new_request(&alice, "a", &[("appA", "r1")]))
            .await
            .unwrap();

        assert!(matches!(
            store.get_for_owner(created.id, &mallory).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.delete(created.id, &mallory).await,
            Err(StoreError::NotFound)
        ));
        assert!(store.get_for_owner(created.id, &alice).await.is_ok());
        store.delete(created.id, &alice).await.unwrap();
        assert!(matches!(store.get(created.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_second_terminal_write_is_rejected() {
        let store = MemoryExportStore::new();
        let created = store
            .create(new_request(&owner(), "a", &[("appA", "r1")]))
            .await
            .unwrap();
        let source_id = created.sources[0].id;

        store
            .update_source(created.id, source_id, SourceStatus::Success, None)
            .await
            .unwrap();
        let err = store
            .update_source(
                created.id,
                source_id,
                SourceStatus::Failed,
                Some(SourceError {
                    message: "late".into(),
                    code: 1,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal));

        let stored = store.get(created.id).await.unwrap();
        assert_eq!(stored.sources[0].status, SourceStatus::Success);
        assert!(stored.sources[0].error.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_terminal_writes_have_one_winner() {
        let store = Arc::new(MemoryExportStore::new());
        let created = store
            .create(new_request(&owner(), "a", &[("appA", "r1")]))
            .await
            .unwrap();
        let source_id = created.sources[0].id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let status = if i % 2 == 0 {
                SourceStatus::Success
            } else {
                SourceStatus::Failed
            };
            handles.push(tokio::spawn(async move {
                store.update_source(created.id, source_id, status, None).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(StoreError::AlreadyTerminal) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_source_is_not_found() {
        let store = MemoryExportStore::new();
        let created = store
            .create(new_request(&owner(), "a", &[("appA", "r1")]))
            .await
            .unwrap();
        let err = store
            .update_source(created.id, Uuid::new_v4(), SourceStatus::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_start_request_is_idempotent() {
        let store = MemoryExportStore::new();
        let created = store
            .create(new_request(&owner(), "a", &[("appA", "r1")]))
            .await
            .unwrap();

        assert!(store.start_request(created.id).await.unwrap());
        assert!(!store.start_request(created.id).await.unwrap());
        assert_eq!(
            store.get(created.id).await.unwrap().status,
            RequestStatus::Running
        );
    }

    #[tokio::test]
    async fn test_archive_key_written_once() {
        let store = MemoryExportStore::new();
        let created = store
            .create(new_request(&owner(), "a", &[("appA", "r1")]))
            .await
            .unwrap();
        let now = Utc::now();

        store
            .set_request_status(
                created.id,
                RequestStatus::Complete,
                Some(now),
                Some("org/first.tar.gz".into()),
            )
            .await
            .unwrap();
        let err = store
            .set_request_status(
                created.id,
                RequestStatus::Complete,
                Some(now),
                Some("org/second.tar.gz".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal));

        let stored = store.get(created.id).await.unwrap();
        assert_eq!(stored.archive_key.as_deref(), Some("org/first.tar.gz"));
        assert_eq!(stored.completed_at, Some(now));
    }

    #[tokio::test]
    async fn test_delete_expired_removes_only_past_due() {
        let clock = ManualClock::default();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        clock.set(t0 - Duration::hours(2));
        let store = MemoryExportStore::with_clock(clock.clone());
        let owner = owner();

        let mut past = new_request(&owner, "past", &[("appA", "r1")]);
        past.expires_at = Some(t0 - Duration::seconds(1));
        let past = store.create(past).await.unwrap();

        let mut future = new_request(&owner, "future", &[("appA", "r1")]);
        future.expires_at = Some(t0 + Duration::hours(1));
        let future = store.create(future).await.unwrap();

        clock.set(t0);
        let removed = store.delete_expired().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, past.id);
        assert_eq!(removed[0].object_prefix(), format!("{}/{}/", owner.organization_id, past.id));
        assert!(matches!(store.get(past.id).await, Err(StoreError::NotFound)));
        assert!(store.get(future.id).await.is_ok());
        assert!(store.delete_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_counts() {
        let store = MemoryExportStore::new();
        let owner = owner();
        store
            .create(new_request(&owner, "Inventory hosts", &[("inventory", "hosts")]))
            .await
            .unwrap();
        store
            .create(new_request(
                &owner,
                "advisor recs",
                &[("advisor", "recs"), ("inventory", "tags")],
            ))
            .await
            .unwrap();
        store
            .create(new_request(&owner, "patch", &[("patch", "systems")]))
            .await
            .unwrap();

        let filter = ExportFilter {
            application: Some("inventory".into()),
            ..Default::default()
        };
        let (count, page) = store.list(&owner, &filter, Page::default()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(page.len(), 2);

        let filter = ExportFilter {
            name: Some("INVENTORY".into()),
            ..Default::default()
        };
        let (count, _) = store.list(&owner, &filter, Page::default()).await.unwrap();
        assert_eq!(count, 1);

        let filter = ExportFilter {
            created: Some(Utc::now().date_naive()),
            status: Some(RequestStatus::Pending),
            ..Default::default()
        };
        let (count, _) = store.list(&owner, &filter, Page::default()).await.unwrap();
        assert_eq!(count, 3);

        let mut stranger = owner.clone();
        stranger.organization_id = "other-org".into();
        let (count, page) = store
            .list(&stranger, &ExportFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_list_sort_and_paging() {
        let store = MemoryExportStore::new();
        let owner = owner();
        for (name, app) in [("b", "zeta"), ("c", "alpha"), ("a", "mid")] {
            store
                .create(new_request(&owner, name, &[(app, "r")]))
                .await
                .unwrap();
        }

        let filter = ExportFilter {
            sort: SortKey::parse_list("name"),
            ..Default::default()
        };
        let (_, page) = store.list(&owner, &filter, Page::default()).await.unwrap();
        let names: Vec<_> = page.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let filter = ExportFilter {
            sort: SortKey::parse_list("-application"),
            ..Default::default()
        };
        let (_, page) = store.list(&owner, &filter, Page::default()).await.unwrap();
        let names: Vec<_> = page.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["b", "a", "c"]);

        let filter = ExportFilter {
            sort: SortKey::parse_list("name,bogus"),
            ..Default::default()
        };
        let (count, page) = store
            .list(&owner, &filter, Page { limit: 1, offset: 1 })
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "b");
    }
}
