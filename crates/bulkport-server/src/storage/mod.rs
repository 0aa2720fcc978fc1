//! Object storage client
//!
//! S3-compatible store holding import uploads and export artifacts. Uploads
//! stream through multipart parts (5 MiB each, at most four in flight) so a
//! million-row export never materializes in memory; downloads come back as
//! an async reader the codec layer pulls from.

use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub mod config;

/// Size of one multipart part.
pub const PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Maximum number of parts uploading concurrently.
pub const MAX_PARTS_IN_FLIGHT: usize = 4;

/// Outcome of an upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub key: String,
    pub size: i64,
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bulkport-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(bucket = %config.bucket, "storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    /// Stream `reader` into the object under `key` using multipart upload.
    #[instrument(skip(self, reader))]
    pub async fn put_stream<R>(
        &self,
        key: &str,
        mut reader: R,
        content_type: &str,
    ) -> Result<UploadResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut upload = self.begin_multipart(key, content_type).await?;
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut chunk).await.context("read upload source")?;
            if n == 0 {
                break;
            }
            upload.write(&chunk[..n]).await?;
        }
        upload.finish().await
    }

    /// Start a multipart upload the caller feeds incrementally.
    pub async fn begin_multipart(&self, key: &str, content_type: &str) -> Result<MultipartUpload> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("create multipart upload")?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow!("S3 returned no upload id"))?
            .to_string();

        debug!(key = %key, upload_id = %upload_id, "multipart upload started");

        Ok(MultipartUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id,
            content_type: content_type.to_string(),
            buffer: Vec::with_capacity(PART_SIZE_BYTES),
            next_part_number: 1,
            total_bytes: 0,
            in_flight: JoinSet::new(),
            completed: Vec::new(),
        })
    }

    /// Download the object under `key` as an async reader.
    #[instrument(skip(self))]
    pub async fn get_stream(
        &self,
        key: &str,
    ) -> Result<impl tokio::io::AsyncBufRead + Send + Unpin> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("download from storage: {}", key))?;

        Ok(response.body.into_async_read())
    }

    /// Issue a presigned GET URL for `key`.
    #[instrument(skip(self))]
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .context("build presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .context("presign GET")?;

        Ok(presigned.uri().to_string())
    }
}

/// An in-progress multipart upload.
///
/// Bytes are buffered up to one part; full parts upload in the background
/// with at most [`MAX_PARTS_IN_FLIGHT`] outstanding. Anything below the S3
/// minimum part size at `finish` time goes up as the (permitted) short final
/// part, or as a plain put for single-part objects.
pub struct MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    content_type: String,
    buffer: Vec<u8>,
    next_part_number: i32,
    total_bytes: i64,
    in_flight: JoinSet<Result<CompletedPart>>,
    completed: Vec<CompletedPart>,
}

impl MultipartUpload {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.total_bytes += bytes.len() as i64;
        self.buffer.extend_from_slice(bytes);
        while self.buffer.len() >= PART_SIZE_BYTES {
            let part: Vec<u8> = self.buffer.drain(..PART_SIZE_BYTES).collect();
            self.spawn_part(part).await?;
        }
        Ok(())
    }

    async fn spawn_part(&mut self, part: Vec<u8>) -> Result<()> {
        // Backpressure: wait for a slot before spawning another part.
        while self.in_flight.len() >= MAX_PARTS_IN_FLIGHT {
            self.drain_one().await?;
        }

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();
        let part_number = self.next_part_number;
        self.next_part_number += 1;

        self.in_flight.spawn(async move {
            let uploaded = client
                .upload_part()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .with_context(|| format!("upload part {}", part_number))?;

            Ok(CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(uploaded.e_tag().map(String::from))
                .build())
        });

        Ok(())
    }

    async fn drain_one(&mut self) -> Result<()> {
        if let Some(joined) = self.in_flight.join_next().await {
            let part = joined.context("part upload task panicked")??;
            self.completed.push(part);
        }
        Ok(())
    }

    pub async fn finish(mut self) -> Result<UploadResult> {
        let result = self.finish_inner().await;
        if result.is_err() {
            self.abort_inner().await;
        }
        result
    }

    /// Drop an upload that will not complete, discarding its parts.
    pub async fn abort(mut self) {
        self.in_flight.abort_all();
        self.abort_inner().await;
    }

    async fn abort_inner(&mut self) {
        // Leftover parts would otherwise linger until a lifecycle rule
        // cleans them up.
        if let Err(abort_err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            warn!(key = %self.key, error = %aws_sdk_s3::error::DisplayErrorContext(&abort_err), "abort multipart upload failed");
        }
    }

    async fn finish_inner(&mut self) -> Result<UploadResult> {
        // Nothing ever reached part size: complete_multipart_upload rejects
        // an empty parts list, so the whole buffer (possibly zero bytes,
        // e.g. an export whose filter matched no rows) goes up as a plain
        // put instead.
        if self.next_part_number == 1 && self.in_flight.is_empty() {
            let body = std::mem::take(&mut self.buffer);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .content_type(&self.content_type)
                .body(ByteStream::from(body))
                .send()
                .await
                .context("upload single-part object")?;
            self.abort_inner().await;

            info!(key = %self.key, size = self.total_bytes, "upload complete");

            return Ok(UploadResult {
                key: self.key.clone(),
                size: self.total_bytes,
            });
        }

        if !self.buffer.is_empty() {
            let part = std::mem::take(&mut self.buffer);
            self.spawn_part(part).await?;
        }
        while !self.in_flight.is_empty() {
            self.drain_one().await?;
        }

        // Complete requires parts in ascending order.
        self.completed
            .sort_by_key(|p| p.part_number().unwrap_or(i32::MAX));

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.completed)))
                    .build(),
            )
            .send()
            .await
            .context("complete multipart upload")?;

        info!(key = %self.key, size = self.total_bytes, "upload complete");

        Ok(UploadResult {
            key: self.key.clone(),
            size: self.total_bytes,
        })
    }
}

/// Key for an uploaded import source file.
pub fn import_key(date: DateTime<Utc>, job_id: Uuid, file_name: &str) -> String {
    format!(
        "imports/{}/{}/{}",
        date.format("%Y-%m-%d"),
        job_id,
        sanitize_filename(file_name)
    )
}

/// Key for an export artifact.
pub fn export_key(date: DateTime<Utc>, job_id: Uuid, extension: &str) -> String {
    format!(
        "exports/{}/{}/export.{}",
        date.format("%Y-%m-%d"),
        job_id,
        extension
    )
}

/// Strip path separators and shell-hostile characters from client filenames.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('_').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("users.csv"), "users.csv");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("my file (1).json"), "my_file__1_.json");
        assert_eq!(sanitize_filename("///"), "upload");
    }

    #[test]
    fn test_import_key_layout() {
        let date = DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let id = Uuid::nil();
        assert_eq!(
            import_key(date, id, "a b.csv"),
            format!("imports/2026-03-04/{}/a_b.csv", id)
        );
    }

    #[test]
    fn test_export_key_layout() {
        let date = DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let id = Uuid::nil();
        assert_eq!(
            export_key(date, id, "ndjson"),
            format!("exports/2026-03-04/{}/export.ndjson", id)
        );
    }
}
