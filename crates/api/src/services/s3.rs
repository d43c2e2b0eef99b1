//! S3-compatible object store.
//!
//! Uploads larger than one part go through the multipart API with a fixed part
//! size; downloads are fetched as ranged GETs so that a single object never has
//! to fit in memory.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use tracing::{debug, warn};

use super::object_store::{ByteStream, ObjectMeta, ObjectStore, ObjectStoreError};
use crate::config::StorageConfig;

/// Object store backed by an S3 bucket.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    upload_part_size: usize,
    download_part_size: u64,
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

fn backend<E: std::fmt::Display>(context: &str, err: E) -> ObjectStoreError {
    ObjectStoreError::Backend(format!("{}: {}", context, err))
}

impl S3ObjectStore {
    /// Builds a client from the storage configuration.
    ///
    /// Static credentials are used when both keys are set; otherwise the
    /// default AWS provider chain applies.
    pub async fn new(config: &StorageConfig) -> Self {
        let region = Region::new(config.region.clone());

        let mut builder = if config.access_key.is_empty() || config.secret_key.is_empty() {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        } else {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "export-service",
            );
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(credentials)
        };

        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            upload_part_size: config.upload_part_size(),
            download_part_size: config.download_part_size(),
        }
    }

    async fn start_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<MultipartUpload, ObjectStoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend("create multipart upload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| backend("create multipart upload", "missing upload id"))?
            .to_string();
        debug!(key, upload_id = %upload_id, "Started multipart upload");

        Ok(MultipartUpload {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload: &mut MultipartUpload,
        data: Bytes,
    ) -> Result<(), ObjectStoreError> {
        let part_number = upload.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|e| backend("upload part", e))?;

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn abort(&self, key: &str, upload: &MultipartUpload) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .send()
            .await
        {
            warn!(
                key,
                upload_id = %upload.upload_id,
                error = %e,
                "Failed to abort multipart upload"
            );
        }
    }

    async fn stream_parts(
        &self,
        key: &str,
        mut body: ByteStream,
        content_type: &str,
        upload: &mut Option<MultipartUpload>,
    ) -> Result<u64, ObjectStoreError> {
        let mut buffer = BytesMut::with_capacity(self.upload_part_size);
        let mut total: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.upload_part_size {
                let part = buffer.split_to(self.upload_part_size).freeze();
                if upload.is_none() {
                    *upload = Some(self.start_multipart(key, content_type).await?);
                }
                if let Some(active) = upload.as_mut() {
                    self.upload_part(key, active, part).await?;
                }
            }
        }

        let Some(active) = upload.as_mut() else {
            // Fits in a single part.
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(S3Body::from(buffer.freeze()))
                .send()
                .await
                .map_err(|e| backend("put object", e))?;
            return Ok(total);
        };

        if !buffer.is_empty() {
            self.upload_part(key, active, buffer.freeze()).await?;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(active.parts.clone()))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&active.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| backend("complete multipart upload", e))?;

        Ok(total)
    }
}

async fn fetch_range(
    client: &Client,
    bucket: &str,
    key: &str,
    start: u64,
    end: u64,
) -> Result<Bytes, ObjectStoreError> {
    let output = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .range(format!("bytes={}-{}", start, end))
        .send()
        .await
        .map_err(|e| backend("get object", e))?;
    let data = output
        .body
        .collect()
        .await
        .map_err(|e| backend("read object body", e))?;
    Ok(data.into_bytes())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<u64, ObjectStoreError> {
        let mut upload = None;
        let result = self.stream_parts(key, body, content_type, &mut upload).await;
        if result.is_err() {
            if let Some(active) = &upload {
                self.abort(key, active).await;
            }
        }
        result
    }

    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let size = self
            .head(key)
            .await?
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?
            .size;

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let part_size = self.download_part_size.max(1);

        let parts = stream::try_unfold(0u64, move |offset| {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();
            async move {
                if offset >= size {
                    return Ok(None);
                }
                let end = (offset + part_size).min(size) - 1;
                fetch_range(&client, &bucket, &key, offset, end)
                    .await
                    .map(|data| Some((data, end + 1)))
            }
        });

        Ok(parts.boxed())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
            })),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(backend("head object", e))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend("delete object", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| backend("list objects", e))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectMeta {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
