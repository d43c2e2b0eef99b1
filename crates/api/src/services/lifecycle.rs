//! Export lifecycle controller.
//!
//! Drives a request from creation through fan-out, per-source callbacks and
//! the one-shot archive build. Work accepted with a 202 runs on tracked
//! background tasks; callers observe the outcome through the store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use domain::models::{
    ExportFilter, ExportRequest, NewExportRequest, Owner, RequestStatus, SourceError,
    SourceStatus,
};
use persistence::{ExportStore, StoreError};
use shared::pagination::Page;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::assembler::{Assembler, SpooledBody};
use super::object_store::{ByteStream, ObjectStore, ObjectStoreError};
use super::publisher::Publisher;

/// Error code recorded on a source whose upload could not be stored.
pub const UPLOAD_FAILED_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("export is not complete")]
    NotComplete,

    #[error("this resource has already been processed")]
    AlreadyTerminal,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

/// Set of ids with work in flight. Membership is released when the guard drops.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<Uuid>>>);

struct InFlightGuard {
    set: InFlight,
    id: Uuid,
}

impl InFlight {
    fn try_acquire(&self, id: Uuid) -> Option<InFlightGuard> {
        let mut ids = self.0.lock().unwrap_or_else(|p| p.into_inner());
        ids.insert(id).then(|| InFlightGuard {
            set: self.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Archive download handed back to the HTTP layer.
pub struct ArchiveDownload {
    pub filename: String,
    pub body: ByteStream,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<dyn ExportStore>,
    objects: Arc<dyn ObjectStore>,
    assembler: Arc<Assembler>,
    publisher: Publisher,
    default_expiry: chrono::Duration,
    sources_in_flight: InFlight,
    assembling: InFlight,
    tasks: TaskTracker,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn ExportStore>,
        objects: Arc<dyn ObjectStore>,
        publisher: Publisher,
        default_expiry_days: i64,
    ) -> Self {
        Self {
            assembler: Arc::new(Assembler::new(store.clone(), objects.clone())),
            store,
            objects,
            publisher,
            default_expiry: chrono::Duration::days(default_expiry_days),
            sources_in_flight: InFlight::default(),
            assembling: InFlight::default(),
            tasks: TaskTracker::new(),
        }
    }

    /// Persists a new request and announces it in the background.
    pub async fn create(
        &self,
        mut new: NewExportRequest,
        identity_header: String,
    ) -> Result<ExportRequest, LifecycleError> {
        if new.expires_at.is_none() {
            new.expires_at = Some(Utc::now() + self.default_expiry);
        }

        let request = self.store.create(new).await?;
        info!(
            request_id = %request.id,
            sources = request.sources.len(),
            format = %request.format,
            "Export request created"
        );

        let publisher = self.publisher.clone();
        let announced = request.clone();
        self.tasks.spawn(
            async move {
                if let Err(e) = publisher.publish(&announced, &identity_header).await {
                    error!(error = %e, "Failed to publish export request");
                }
            }
            .instrument(info_span!("publish", request_id = %request.id)),
        );

        Ok(request)
    }

    pub async fn list(
        &self,
        owner: &Owner,
        filter: &ExportFilter,
        page: Page,
    ) -> Result<(i64, Vec<ExportRequest>), LifecycleError> {
        Ok(self.store.list(owner, filter, page).await?)
    }

    pub async fn get_status(
        &self,
        owner: &Owner,
        id: Uuid,
    ) -> Result<ExportRequest, LifecycleError> {
        Ok(self.store.get_for_owner(id, owner).await?)
    }

    /// Opens the archive of a complete or partial request.
    pub async fn get_archive(
        &self,
        owner: &Owner,
        id: Uuid,
    ) -> Result<ArchiveDownload, LifecycleError> {
        let request = self.store.get_for_owner(id, owner).await?;
        let key = match (&request.archive_key, request.status.has_archive()) {
            (Some(key), true) => key,
            _ => return Err(LifecycleError::NotComplete),
        };

        let body = self.objects.get(key).await?;
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        Ok(ArchiveDownload { filename, body })
    }

    /// Deletes the request, then removes its objects best-effort.
    pub async fn delete(&self, owner: &Owner, id: Uuid) -> Result<(), LifecycleError> {
        let request = self.store.get_for_owner(id, owner).await?;
        self.store.delete(id, owner).await?;
        info!(request_id = %id, "Export request deleted");

        self.remove_objects(id, &request.object_prefix(), request.archive_key.as_deref())
            .await;
        Ok(())
    }

    /// Deletes every request past its expiry together with its objects.
    ///
    /// Returns the number of requests removed.
    pub async fn sweep_expired(&self) -> Result<u64, LifecycleError> {
        let expired = self.store.delete_expired().await?;
        for export in &expired {
            self.remove_objects(export.id, &export.object_prefix(), export.archive_key.as_deref())
                .await;
        }
        Ok(expired.len() as u64)
    }

    /// Best-effort removal of a request's source objects and archive.
    async fn remove_objects(&self, id: Uuid, prefix: &str, archive_key: Option<&str>) {
        let mut keys: Vec<String> = archive_key.map(str::to_string).into_iter().collect();
        match self.objects.list(prefix).await {
            Ok(objects) => keys.extend(objects.into_iter().map(|o| o.key)),
            Err(e) => warn!(request_id = %id, error = %e, "Failed to list export objects"),
        }
        for key in keys {
            if let Err(e) = self.objects.delete(&key).await {
                warn!(request_id = %id, key = %key, error = %e, "Failed to delete export object");
            }
        }
    }

    /// Accepts one source's payload.
    ///
    /// The body is read to the end into a local spool file before this
    /// returns, since the client stops sending once it has its answer. The
    /// object-store upload and the status update run in the background.
    pub async fn on_source_upload(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        application: &str,
        body: ByteStream,
    ) -> Result<(), LifecycleError> {
        let (request, guard) = self.claim_source(request_id, source_id, application).await?;
        let spooled = SpooledBody::spool(body).await;

        let controller = self.clone();
        self.tasks.spawn(
            async move {
                let _guard = guard;
                let stored = match spooled {
                    Ok(body) => {
                        debug!(size = body.size(), "Source payload received");
                        controller
                            .assembler
                            .store_source(&request, source_id, body.into_stream())
                            .await
                    }
                    Err(e) => Err(e),
                };
                let outcome = match stored {
                    Ok(_) => (SourceStatus::Success, None),
                    Err(e) => {
                        warn!(error = %e, "Source upload failed");
                        (
                            SourceStatus::Failed,
                            Some(SourceError {
                                message: e.to_string(),
                                code: UPLOAD_FAILED_CODE,
                            }),
                        )
                    }
                };
                controller
                    .finish_source(request_id, source_id, outcome.0, outcome.1)
                    .await;
            }
            .instrument(info_span!(
                "source_upload",
                request_id = %request_id,
                source_id = %source_id
            )),
        );

        Ok(())
    }

    /// Records an upstream application's failure for one source.
    pub async fn on_source_error(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        application: &str,
        source_error: SourceError,
    ) -> Result<(), LifecycleError> {
        let (_, guard) = self.claim_source(request_id, source_id, application).await?;
        // A request left pending would never be assembled, so fail the call instead.
        self.store.start_request(request_id).await?;

        let controller = self.clone();
        self.tasks.spawn(
            async move {
                let _guard = guard;
                controller
                    .finish_source(request_id, source_id, SourceStatus::Failed, Some(source_error))
                    .await;
            }
            .instrument(info_span!(
                "source_error",
                request_id = %request_id,
                source_id = %source_id
            )),
        );

        Ok(())
    }

    /// Resolves the request and source of a callback and reserves the source.
    async fn claim_source(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        application: &str,
    ) -> Result<(ExportRequest, InFlightGuard), LifecycleError> {
        // Reserve before reading, so a claim that wins after the previous
        // holder released always sees the status it wrote.
        let guard = self
            .sources_in_flight
            .try_acquire(source_id)
            .ok_or(LifecycleError::AlreadyTerminal)?;

        let request = match self.store.get(request_id).await {
            Ok(request) => request,
            Err(StoreError::NotFound) => return Err(LifecycleError::NotFound("export".into())),
            Err(e) => return Err(e.into()),
        };

        let source = request
            .source(source_id)
            .filter(|s| s.application == application)
            .ok_or_else(|| LifecycleError::NotFound("source".into()))?;
        if source.status.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal);
        }
        Ok((request, guard))
    }

    async fn finish_source(
        &self,
        request_id: Uuid,
        source_id: Uuid,
        status: SourceStatus,
        source_error: Option<SourceError>,
    ) {
        match self
            .store
            .update_source(request_id, source_id, status, source_error)
            .await
        {
            Ok(()) => debug!(status = %status, "Source finished"),
            Err(StoreError::AlreadyTerminal) => {
                warn!("Source was already terminal, ignoring late result");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to record source status");
                return;
            }
        }

        if let Err(e) = self.maybe_assemble(request_id).await {
            error!(error = %e, "Failed to evaluate export for assembly");
        }
    }

    /// Moves the request forward once every source is terminal.
    ///
    /// All-failed requests fail immediately. Otherwise an assembly is started
    /// if the request is still running and none is in flight for it.
    pub async fn maybe_assemble(&self, request_id: Uuid) -> Result<(), LifecycleError> {
        let request = self.store.get(request_id).await?;

        match request.aggregate_status() {
            RequestStatus::Pending | RequestStatus::Running => Ok(()),
            RequestStatus::Failed => {
                if !request.status.is_terminal() {
                    self.store
                        .set_request_status(
                            request_id,
                            RequestStatus::Failed,
                            Some(Utc::now()),
                            None,
                        )
                        .await?;
                    info!(request_id = %request_id, "Export failed, every source failed");
                }
                Ok(())
            }
            outcome @ (RequestStatus::Complete | RequestStatus::Partial) => {
                if request.status != RequestStatus::Running {
                    return Ok(());
                }
                let Some(guard) = self.assembling.try_acquire(request_id) else {
                    debug!(request_id = %request_id, "Assembly already in flight");
                    return Ok(());
                };

                let controller = self.clone();
                self.tasks.spawn(
                    async move {
                        let _guard = guard;
                        controller.run_assembly(request_id, outcome).await;
                    }
                    .instrument(info_span!("assemble", request_id = %request_id)),
                );
                Ok(())
            }
        }
    }

    async fn run_assembly(&self, request_id: Uuid, outcome: RequestStatus) {
        // Another assembly may have finished between the check and the gate.
        match self.store.get(request_id).await {
            Ok(request) if request.status == RequestStatus::Running => {}
            Ok(_) => return,
            Err(e) => {
                error!(error = %e, "Failed to reload export before assembly");
                return;
            }
        }

        let result = match self.assembler.assemble(request_id).await {
            Ok((completed_at, key)) => {
                let written = self
                    .store
                    .set_request_status(request_id, outcome, Some(completed_at), Some(key.clone()))
                    .await;
                if written.is_ok() {
                    info!(status = %outcome, key = %key, "Export complete");
                }
                written
            }
            Err(e) => {
                error!(error = %e, "Archive assembly failed");
                self.store
                    .set_request_status(request_id, RequestStatus::Failed, Some(Utc::now()), None)
                    .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "Failed to record export outcome");
        }
    }

    /// Waits until every background task has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Gives background work up to `timeout` to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                pending = self.tasks.len(),
                "Background export tasks still running at shutdown"
            );
        }
    }
}
