//! S3-compatible storage backend using AWS SDK.

use crate::abort::AbortOnDrop;
use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, CompletedPart, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{CompletedMultipartUpload, MetadataDirective};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::time::Duration;
use stowage_core::CacheSettings;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum buffer size before spilling to temp file (64 MiB).
/// This prevents unbounded memory growth if the caller sends many small chunks.
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "stowage-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "stowage-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure access_key_id/secret_access_key or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

/// Handle bare host:port endpoints (e.g., "minio:9000") by prepending http://
fn normalize_endpoint(endpoint_url: &str) -> String {
    let endpoint_lower = endpoint_url.to_lowercase();
    if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
        endpoint_url.to_string()
    } else {
        format!("http://{}", endpoint_url)
    }
}

/// S3-compatible object store using AWS SDK.
///
/// Keys are used verbatim; the cache builds full keys including its prefixes.
pub struct S3Backend {
    client: Client,
    bucket: String,
    endpoint: Option<String>,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend from cache settings.
    ///
    /// Path-style addressing (`endpoint/bucket/key`) is only applied together
    /// with an explicit endpoint, which is where S3-compatible services such as
    /// MinIO need it. Without static credentials the ambient AWS credential
    /// chain is used.
    pub fn new(settings: &CacheSettings) -> StorageResult<Self> {
        settings
            .validate()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        // Build S3 client config directly and defer ambient credentials chain
        // initialization until first signed request.
        let region = settings.region.clone();
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        if let Some((key_id, secret, session_token)) = settings.static_credentials() {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                session_token.map(str::to_string),
                None, // expiration
                "stowage-settings",
            );
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(region.clone()));
        }

        let endpoint = settings.endpoint_url.as_deref().map(normalize_endpoint);
        if let Some(endpoint_url) = &endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // For explicit HTTP endpoints (e.g. local MinIO), use an HTTP-only client
            // so SDK initialization doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }

            if settings.use_path_style {
                s3_config_builder = s3_config_builder.force_path_style(true);
            }
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
            endpoint,
            region,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// CopySource header value for an object in this bucket.
    ///
    /// The key portion must be URL-encoded for special characters (spaces,
    /// unicode, etc.); the bucket name and the slash separator are not.
    fn copy_source(&self, key: &str) -> String {
        let encoded_key = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        format!("{}/{}", self.bucket, encoded_key)
    }

    /// Convert an AWS SDK error to StorageError.
    ///
    /// Only a missing key becomes [`StorageError::NotFound`]. A missing bucket
    /// also answers 404 but is a configuration problem, not a cold cache.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
            && is_missing_key(service_err.raw().status().as_u16(), service_err.err().code())
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    async fn start_upload(&self, key: &str) -> StorageResult<S3Upload> {
        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Multipart("S3 did not return upload_id".to_string()))?
            .to_string();

        let guard = {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            AbortOnDrop::new(format!("{key}/{upload_id}"), async move {
                if let Err(e) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key = %key,
                        upload_id = %upload_id,
                        error = %e,
                        "Failed to abort dropped multipart upload, orphaned parts may remain"
                    );
                }
            })
        };

        Ok(S3Upload {
            guard,
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
            spill_file: None,
            spill_bytes: 0,
            spill_read_pos: 0,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        // Convert AWS DateTime to time::OffsetDateTime
        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        key = %key,
                        timestamp = dt.secs(),
                        error = %e,
                        "Failed to convert S3 timestamp, object will be treated as stale"
                    );
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        // Convert AWS ByteStream to AsyncRead, then wrap with ReaderStream for true streaming
        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, body), fields(backend = "s3"))]
    async fn put(&self, key: &str, mut body: ByteStream) -> StorageResult<u64> {
        let mut upload = self.start_upload(key).await?;

        while let Some(chunk) = body.next().await {
            let written = match chunk {
                Ok(data) => upload.write(data).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                upload.abort().await;
                return Err(e);
            }
        }

        upload.finish().await
    }

    #[instrument(skip(self, metadata), fields(backend = "s3"))]
    async fn copy_replace_metadata(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(self.copy_source(key))
            .set_metadata(Some(metadata.clone()))
            .metadata_directive(MetadataDirective::Replace)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Multipart("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self, range), fields(backend = "s3", range = %range))]
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        range: ByteRange,
    ) -> StorageResult<CompletedPart> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(self.copy_source(key))
            .copy_source_range(range.to_string())
            .part_number(part_number)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let etag = output
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .ok_or_else(|| {
                StorageError::Multipart(format!(
                    "S3 returned no ETag for part {part_number} of {key}"
                ))
            })?;

        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let completed = parts
            .iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let health_check_future = async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, &self.bucket))?;
            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// Streaming upload for S3 backend using multipart upload.
///
/// Buffers incoming data to meet S3's 5 MB minimum part size requirement.
/// If the buffer exceeds 64 MiB, data spills to a temporary file to bound memory usage.
/// Error codes S3 uses for an object that does not exist. `HeadObject`
/// responses carry no body, so their 404 arrives with the synthesized
/// `NotFound` code or none at all.
fn is_missing_key(status: u16, code: Option<&str>) -> bool {
    match code {
        Some("NoSuchKey") | Some("NotFound") => true,
        Some(_) => false,
        None => status == 404,
    }
}

struct S3Upload {
    /// Aborts the upload if this value is dropped before finishing.
    guard: AbortOnDrop,
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    /// In-memory buffer for accumulating data until we reach MIN_PART_SIZE.
    buffer: Vec<u8>,
    /// Temporary file for spillover when buffer exceeds MAX_BUFFER_SIZE.
    spill_file: Option<tokio::fs::File>,
    /// Bytes written to spill file (tracked separately from buffer).
    spill_bytes: usize,
    /// Position of next byte to read from spill file.
    spill_read_pos: usize,
}

impl S3Upload {
    /// Upload a single part to S3 and track it.
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let upload_output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let completed_part = aws_sdk_s3::types::CompletedPart::builder()
            .e_tag(upload_output.e_tag().unwrap_or_default())
            .part_number(self.part_number)
            .build();

        self.parts.push(completed_part);
        self.part_number += 1;

        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

        self.bytes_written += data.len() as u64;

        if let Some(ref mut file) = self.spill_file {
            file.write_all(&data).await.map_err(StorageError::Io)?;
            self.spill_bytes += data.len();
        } else {
            self.buffer.extend_from_slice(&data);

            if self.buffer.len() > MAX_BUFFER_SIZE {
                let mut file =
                    tokio::fs::File::from_std(tempfile::tempfile().map_err(StorageError::Io)?);
                file.write_all(&self.buffer)
                    .await
                    .map_err(StorageError::Io)?;
                self.spill_bytes = self.buffer.len();
                self.buffer.clear();
                self.buffer.shrink_to_fit();
                self.spill_file = Some(file);
                tracing::debug!(
                    key = %self.key,
                    spill_bytes = self.spill_bytes,
                    "S3 upload spilled to temp file due to buffer overflow"
                );
            }
        }

        // Upload parts when we have enough unread data in spill file.
        while self.spill_bytes - self.spill_read_pos >= MIN_PART_SIZE
            && let Some(file) = self.spill_file.as_mut()
        {
            file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                .await
                .map_err(StorageError::Io)?;

            let mut part_data = vec![0u8; MIN_PART_SIZE];
            file.read_exact(&mut part_data)
                .await
                .map_err(StorageError::Io)?;

            self.spill_read_pos += MIN_PART_SIZE;
            self.upload_part(Bytes::from(part_data)).await?;
        }

        while self.buffer.len() >= MIN_PART_SIZE && self.spill_file.is_none() {
            let part_data: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            self.upload_part(Bytes::from(part_data)).await?;
        }

        Ok(())
    }

    /// Upload the remaining data as the last part and complete the upload.
    ///
    /// The upload is aborted if the final part or the completion fails.
    async fn finish(mut self) -> StorageResult<u64> {
        match self.finish_parts().await {
            Ok(()) => {
                self.guard.disarm();
                Ok(self.bytes_written)
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn finish_parts(&mut self) -> StorageResult<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        // Last part can be any size, including < 5 MB.
        let mut final_data = Vec::new();

        if let Some(mut file) = self.spill_file.take() {
            let remaining = self.spill_bytes - self.spill_read_pos;
            if remaining > 0 {
                file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                    .await
                    .map_err(StorageError::Io)?;
                final_data.reserve(remaining);
                file.take(remaining as u64)
                    .read_to_end(&mut final_data)
                    .await
                    .map_err(StorageError::Io)?;
            }
        }

        final_data.extend_from_slice(&self.buffer);
        self.buffer.clear();

        if !final_data.is_empty() {
            self.upload_part(Bytes::from(final_data)).await?;
        }

        // S3 multipart requires parts to be at least 1 byte, so empty objects
        // go through PutObject instead.
        if self.parts.is_empty() {
            self.abort_quietly("zero-byte object").await;
            self.guard.disarm();
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            return Ok(());
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    async fn abort(mut self) {
        self.guard.disarm();
        self.abort_quietly("failed upload").await;
    }

    /// Best-effort abort; failures leave orphaned parts and are only logged.
    async fn abort_quietly(&self, reason: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                reason,
                error = %e,
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }
}
