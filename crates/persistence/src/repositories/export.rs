//! PostgreSQL implementation of the export request store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use domain::models::{
    ExportFilter, ExportRequest, ExportSource, NewExportRequest, Owner, RequestStatus,
    SortField, SourceError, SourceStatus, DEFAULT_EXPIRY_DAYS,
};
use shared::pagination::Page;

use crate::entities::{ExportRequestEntity, ExportSourceEntity};
use crate::metrics::QueryTimer;
use crate::store::{
    check_source_transition, validate_new_request, ExpiredExport, ExportStore, StoreError,
};

const REQUEST_COLUMNS: &str = "r.id, r.account_id, r.organization_id, r.username, r.name, \
     r.format, r.status, r.created_at, r.updated_at, r.completed_at, r.expires_at, r.archive_key";

/// Repository for export requests backed by PostgreSQL.
#[derive(Clone)]
pub struct ExportRepository {
    pool: PgPool,
    default_expiry: Duration,
}

impl ExportRepository {
    /// Creates a new ExportRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_expiry: Duration::days(DEFAULT_EXPIRY_DAYS),
        }
    }

    /// Overrides the expiry applied when a request does not carry one.
    pub fn with_default_expiry(mut self, default_expiry: Duration) -> Self {
        self.default_expiry = default_expiry;
        self
    }

    async fn load_sources(
        &self,
        request_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<ExportSource>>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ExportSourceEntity>(
            r#"
            SELECT id, export_request_id, position, application, resource, filters,
                   status, error_message, error_code, created_at, updated_at
            FROM export_sources
            WHERE export_request_id = ANY($1)
            ORDER BY export_request_id, position
            "#,
        )
        .bind(request_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<ExportSource>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.export_request_id)
                .or_default()
                .push(row.into());
        }
        Ok(grouped)
    }

    async fn hydrate(&self, entity: ExportRequestEntity) -> Result<ExportRequest, sqlx::Error> {
        let mut sources = self.load_sources(&[entity.id]).await?;
        let own = sources.remove(&entity.id).unwrap_or_default();
        Ok(entity.into_domain(own))
    }

    async fn exists(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM export_requests WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }
}

/// A stored status that does not parse must never be mistaken for `pending`.
fn stored_source_status(source_id: Uuid, raw: &str) -> Result<SourceStatus, StoreError> {
    raw.parse().map_err(|_| {
        StoreError::Corrupt(format!("source {} has unknown status {:?}", source_id, raw))
    })
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filters<'a>(
    qb: &mut QueryBuilder<'a, Postgres>,
    owner: &'a Owner,
    filter: &'a ExportFilter,
) {
    qb.push(" WHERE r.account_id = ")
        .push_bind(owner.account_id.as_str())
        .push(" AND r.organization_id = ")
        .push_bind(owner.organization_id.as_str())
        .push(" AND r.username = ")
        .push_bind(owner.username.as_str());

    if let Some(name) = &filter.name {
        qb.push(" AND r.name ILIKE ")
            .push_bind(format!("%{}%", escape_like(name)));
    }
    if let Some(application) = &filter.application {
        qb.push(" AND EXISTS (SELECT 1 FROM export_sources s")
            .push(" WHERE s.export_request_id = r.id AND s.application = ")
            .push_bind(application.as_str())
            .push(")");
    }
    if let Some(resource) = &filter.resource {
        qb.push(" AND EXISTS (SELECT 1 FROM export_sources s")
            .push(" WHERE s.export_request_id = r.id AND s.resource = ")
            .push_bind(resource.as_str())
            .push(")");
    }
    if let Some(created) = filter.created {
        qb.push(" AND (r.created_at AT TIME ZONE 'UTC')::date = ")
            .push_bind(created);
    }
    if let Some(expires) = filter.expires {
        qb.push(" AND (r.expires_at AT TIME ZONE 'UTC')::date = ")
            .push_bind(expires);
    }
    if let Some(status) = filter.status {
        qb.push(" AND r.status = ").push_bind(status.as_str());
    }
}

fn sort_expression(field: SortField) -> &'static str {
    match field {
        SortField::Name => "r.name",
        SortField::Created => "r.created_at",
        SortField::Expires => "r.expires_at",
        SortField::Application => {
            "(SELECT MIN(s.application) FROM export_sources s WHERE s.export_request_id = r.id)"
        }
        SortField::Resource => {
            "(SELECT MIN(s.resource) FROM export_sources s WHERE s.export_request_id = r.id)"
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, filter: &ExportFilter) {
    qb.push(" ORDER BY ");
    for key in &filter.sort {
        qb.push(sort_expression(key.field));
        qb.push(if key.descending { " DESC, " } else { " ASC, " });
    }
    // Stable tail so pages never overlap.
    qb.push("r.created_at DESC, r.id ASC");
}

#[async_trait]
impl ExportStore for ExportRepository {
    async fn create(&self, new: NewExportRequest) -> Result<ExportRequest, StoreError> {
        // TIMESTAMPTZ keeps microseconds; truncate so the returned value matches a re-read.
        let now = Utc::now().trunc_subsecs(6);
        validate_new_request(&new, now)?;

        let timer = QueryTimer::postgres("create_export_request");
        let request_id = Uuid::new_v4();
        let expires_at = new
            .expires_at
            .map(|e| e.trunc_subsecs(6))
            .unwrap_or(now + self.default_expiry);

        let mut tx = self.pool.begin().await?;

        let entity = sqlx::query_as::<_, ExportRequestEntity>(
            r#"
            INSERT INTO export_requests
                (id, account_id, organization_id, username, name, format, status,
                 created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $7, $8)
            RETURNING id, account_id, organization_id, username, name, format, status,
                      created_at, updated_at, completed_at, expires_at, archive_key
            "#,
        )
        .bind(request_id)
        .bind(&new.owner.account_id)
        .bind(&new.owner.organization_id)
        .bind(&new.owner.username)
        .bind(&new.name)
        .bind(new.format.extension())
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let sources: Vec<ExportSource> = new
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
            .collect();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO export_sources \
             (id, export_request_id, position, application, resource, filters, status, \
             created_at, updated_at) ",
        );
        qb.push_values(sources.iter().enumerate(), |mut row, (position, source)| {
            row.push_bind(source.id)
                .push_bind(request_id)
                .push_bind(position as i32)
                .push_bind(source.application.clone())
                .push_bind(source.resource.clone())
                .push_bind(source.filters.clone())
                .push_bind(SourceStatus::Pending.as_str())
                .push_bind(now)
                .push_bind(now);
        });
        qb.build().execute(&mut *tx).await?;

        tx.commit().await?;
        timer.record();
        Ok(entity.into_domain(sources))
    }

    async fn get(&self, id: Uuid) -> Result<ExportRequest, StoreError> {
        let timer = QueryTimer::postgres("get_export_request");
        let entity = sqlx::query_as::<_, ExportRequestEntity>(&format!(
            "SELECT {} FROM export_requests r WHERE r.id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let request = self.hydrate(entity).await?;
        Ok(timer.observe(request))
    }

    async fn get_for_owner(&self, id: Uuid, owner: &Owner) -> Result<ExportRequest, StoreError> {
        let timer = QueryTimer::postgres("get_export_request_for_owner");
        let entity = sqlx::query_as::<_, ExportRequestEntity>(&format!(
            "SELECT {} FROM export_requests r \
             WHERE r.id = $1 AND r.account_id = $2 AND r.organization_id = $3 AND r.username = $4",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .bind(&owner.account_id)
        .bind(&owner.organization_id)
        .bind(&owner.username)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let request = self.hydrate(entity).await?;
        Ok(timer.observe(request))
    }

    async fn list(
        &self,
        owner: &Owner,
        filter: &ExportFilter,
        page: Page,
    ) -> Result<(i64, Vec<ExportRequest>), StoreError> {
        let timer = QueryTimer::postgres("list_export_requests");

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM export_requests r");
        push_filters(&mut count_qb, owner, filter);
        let count: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM export_requests r", REQUEST_COLUMNS));
        push_filters(&mut qb, owner, filter);
        push_order(&mut qb, filter);
        qb.push(" LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let entities: Vec<ExportRequestEntity> =
            qb.build_query_as().fetch_all(&self.pool).await?;

        let ids: Vec<Uuid> = entities.iter().map(|e| e.id).collect();
        let mut sources = self.load_sources(&ids).await?;
        let requests = entities
            .into_iter()
            .map(|e| {
                let own = sources.remove(&e.id).unwrap_or_default();
                e.into_domain(own)
            })
            .collect();

        timer.record();
        Ok((count, requests))
    }

    async fn delete(&self, id: Uuid, owner: &Owner) -> Result<(), StoreError> {
        let timer = QueryTimer::postgres("delete_export_request");
        let result = sqlx::query(
            r#"
            DELETE FROM export_requests
            WHERE id = $1 AND account_id = $2 AND organization_id = $3 AND username = $4
            "#,
        )
        .bind(id)
        .bind(&owner.account_id)
        .bind(&owner.organization_id)
        .bind(&owner.username)
        .execute(&self.pool)
        .await?;
        timer.record();

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_source(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        status: SourceStatus,
        error: Option<SourceError>,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::postgres("update_export_source");

        // The row lock serializes concurrent callbacks for the same source.
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar(
            r#"
            SELECT status FROM export_sources
            WHERE id = $1 AND export_request_id = $2
            FOR UPDATE
            "#,
        )
        .bind(source_id)
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        check_source_transition(stored_source_status(source_id, &current)?, status)?;

        let (message, code) = match error {
            Some(e) => (Some(e.message), Some(e.code)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE export_sources
            SET status = $3, error_message = $4, error_code = $5, updated_at = NOW()
            WHERE id = $1 AND export_request_id = $2
            "#,
        )
        .bind(source_id)
        .bind(request_id)
        .bind(status.as_str())
        .bind(message)
        .bind(code)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE export_requests SET updated_at = NOW() WHERE id = $1")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        timer.record();
        Ok(())
    }

    async fn start_request(&self, id: Uuid) -> Result<bool, StoreError> {
        let timer = QueryTimer::postgres("start_export_request");
        let result = sqlx::query(
            r#"
            UPDATE export_requests
            SET status = 'running', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(timer.observe(true));
        }
        if !self.exists(id).await? {
            return Err(StoreError::NotFound);
        }
        Ok(timer.observe(false))
    }

    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
        archive_key: Option<String>,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::postgres("set_export_request_status");
        let result = sqlx::query(
            r#"
            UPDATE export_requests
            SET status = $2,
                completed_at = COALESCE($3, completed_at),
                archive_key = COALESCE($4, archive_key),
                updated_at = NOW()
            WHERE id = $1 AND ($4::TEXT IS NULL OR archive_key IS NULL)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(archive_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            timer.record();
            return Ok(());
        }
        if self.exists(id).await? {
            Err(StoreError::AlreadyTerminal)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn delete_expired(&self) -> Result<Vec<ExpiredExport>, StoreError> {
        let timer = QueryTimer::postgres("delete_expired_export_requests");
        let rows: Vec<(Uuid, String, Option<String>)> = sqlx::query_as(
            r#"
            DELETE FROM export_requests
            WHERE expires_at < NOW()
            RETURNING id, organization_id, archive_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        timer.record();

        tracing::debug!(deleted = rows.len(), "Expired export requests removed");
        Ok(rows
            .into_iter()
            .map(|(id, organization_id, archive_key)| ExpiredExport {
                id,
                organization_id,
                archive_key,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Queries against a live database are covered in tests/export_repository.rs.
    use super::*;
    use domain::models::SortKey;

    #[test]
    fn test_stored_source_status_rejects_unknown_values() {
        let id = Uuid::new_v4();
        assert_eq!(stored_source_status(id, "success").unwrap(), SourceStatus::Success);
        assert!(matches!(
            stored_source_status(id, "done"),
            Err(StoreError::Corrupt(msg)) if msg.contains("done")
        ));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_list_sql_shape() {
        let owner = Owner {
            account_id: "1".into(),
            organization_id: "2".into(),
            username: "u".into(),
        };
        let filter = ExportFilter {
            name: Some("inv".into()),
            application: Some("advisor".into()),
            status: Some(RequestStatus::Complete),
            sort: SortKey::parse_list("-application,name"),
            ..Default::default()
        };

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT r.id FROM export_requests r");
        push_filters(&mut qb, &owner, &filter);
        push_order(&mut qb, &filter);
        let sql = qb.sql();

        assert!(sql.contains("r.username = $3"));
        assert!(sql.contains("r.name ILIKE $4"));
        assert!(sql.contains("s.application = $5"));
        assert!(sql.contains("r.status = $6"));
        assert!(sql.contains(
            "MIN(s.application) FROM export_sources s \
             WHERE s.export_request_id = r.id) DESC, r.name ASC"
        ));
        assert!(sql.ends_with("r.created_at DESC, r.id ASC"));
    }
}
