//! Archive assembler.
//!
//! Stores per-source bodies under the request prefix and, once every source
//! is terminal, packs the successful ones into a ZIP together with
//! `meta.json` and `README.md`.

use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use domain::models::{archive_key, ExportMeta, ExportRequest, FileMeta, SourceStatus};
use futures::StreamExt;
use persistence::{ExportStore, StoreError};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::object_store::{ByteStream, ObjectStore, ObjectStoreError};
use crate::middleware::metrics::record_source_upload;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("source {0} not found")]
    UnknownSource(Uuid),

    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("archive task failed: {0}")]
    Task(String),
}

/// A request body buffered in an anonymous temporary file.
pub struct SpooledBody {
    file: tokio::fs::File,
    size: u64,
}

impl SpooledBody {
    /// Reads `body` to the end. The file is removed once dropped.
    pub async fn spool(mut body: ByteStream) -> Result<Self, AssemblyError> {
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(|e| AssemblyError::Task(e.to_string()))??;
        let mut file = tokio::fs::File::from_std(file);

        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;

        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_stream(self) -> ByteStream {
        ReaderStream::new(self.file)
            .map(|chunk| chunk.map_err(|e| ObjectStoreError::Body(e.to_string())))
            .boxed()
    }
}

pub struct Assembler {
    store: Arc<dyn ExportStore>,
    objects: Arc<dyn ObjectStore>,
}

impl Assembler {
    pub fn new(store: Arc<dyn ExportStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Streams one source's body to `<org>/<request>/<source>.<format>`.
    ///
    /// Moves the request to running first. A failed upload removes whatever
    /// part of the object was written.
    pub async fn store_source(
        &self,
        request: &ExportRequest,
        source_id: Uuid,
        body: ByteStream,
    ) -> Result<u64, AssemblyError> {
        let source = request
            .source(source_id)
            .ok_or(AssemblyError::UnknownSource(source_id))?;

        if self.store.start_request(request.id).await? {
            debug!(request_id = %request.id, "Export running");
        }

        let key = request.source_key(source_id);
        let owner = &request.owner;
        let content_type = match request.format {
            domain::models::PayloadFormat::Csv => "text/csv",
            domain::models::PayloadFormat::Json => "application/json",
        };

        match self.objects.put(&key, body, content_type).await {
            Ok(size) => {
                record_source_upload(
                    &owner.account_id,
                    &owner.organization_id,
                    &source.application,
                    Some(size),
                );
                info!(
                    request_id = %request.id,
                    source_id = %source_id,
                    key = %key,
                    size,
                    "Source payload stored"
                );
                Ok(size)
            }
            Err(e) => {
                record_source_upload(
                    &owner.account_id,
                    &owner.organization_id,
                    &source.application,
                    None,
                );
                if let Err(cleanup) = self.objects.delete(&key).await {
                    warn!(key = %key, error = %cleanup, "Failed to remove partial upload");
                }
                Err(e.into())
            }
        }
    }

    /// Builds and uploads the archive for a request whose sources are all
    /// terminal. Returns the completion time and the archive key; the request
    /// row is left untouched.
    pub async fn assemble(
        &self,
        request_id: Uuid,
    ) -> Result<(DateTime<Utc>, String), AssemblyError> {
        let request = self.store.get(request_id).await?;
        let prefix = request.object_prefix();
        let objects = self.objects.list(&prefix).await?;

        let workdir = tempfile::tempdir()?;
        let mut files: Vec<(String, PathBuf)> = Vec::with_capacity(objects.len());
        let mut file_meta = Vec::with_capacity(objects.len());

        for object in objects {
            let filename = basename(&object.key).to_string();
            let source = source_id_of(&filename).and_then(|id| request.source(id));
            let Some(source) = source.filter(|s| s.status == SourceStatus::Success) else {
                warn!(
                    request_id = %request.id,
                    key = %object.key,
                    "Skipping object without a successful source"
                );
                continue;
            };

            let path = workdir.path().join(&filename);
            self.download(&object.key, &path).await?;

            file_meta.push(FileMeta {
                filename: filename.clone(),
                application: source.application.clone(),
                resource: source.resource.clone(),
                filters: source.filters.clone(),
            });
            files.push((filename, path));
        }

        let completed_at = Utc::now().trunc_subsecs(6);
        let meta = ExportMeta::new(
            &request.owner.username,
            &request.owner.organization_id,
            completed_at,
            file_meta,
        );
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        let readme = meta.render_readme();

        let archive_path = workdir.path().join(format!("{}.zip", request.id));
        let zip_path = archive_path.clone();
        tokio::task::spawn_blocking(move || write_archive(&zip_path, &files, &meta_json, &readme))
            .await
            .map_err(|e| AssemblyError::Task(e.to_string()))??;

        let key = archive_key(&request.owner.organization_id, completed_at, request.id);
        let file = tokio::fs::File::open(&archive_path).await?;
        let body = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| ObjectStoreError::Body(e.to_string())))
            .boxed();
        let size = self.objects.put(&key, body, ARCHIVE_CONTENT_TYPE).await?;

        info!(
            request_id = %request.id,
            key = %key,
            size,
            files = meta.file_meta.len(),
            "Archive uploaded"
        );
        Ok((completed_at, key))
    }

    async fn download(&self, key: &str, path: &Path) -> Result<(), AssemblyError> {
        let mut body = self.objects.get(key).await?;
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// `<source_id>.<ext>` -> source id
fn source_id_of(filename: &str) -> Option<Uuid> {
    let stem = filename.split('.').next()?;
    Uuid::parse_str(stem).ok()
}

fn write_archive(
    path: &Path,
    files: &[(String, PathBuf)],
    meta_json: &[u8],
    readme: &str,
) -> Result<(), AssemblyError> {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, source) in files {
        zip.start_file(name.as_str(), options)?;
        let mut input = std::fs::File::open(source)?;
        std::io::copy(&mut input, &mut zip)?;
    }

    zip.start_file("meta.json", options)?;
    zip.write_all(meta_json)?;
    zip.start_file("README.md", options)?;
    zip.write_all(readme.as_bytes())?;

    zip.finish()?.flush()?;
    Ok(())
}
