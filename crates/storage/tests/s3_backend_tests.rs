mod common;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use common::{chunked_stream, seeded_bytes};
use futures::StreamExt;
use std::collections::HashMap;
use stowage_core::CacheSettings;
use stowage_storage::backends::s3::S3Backend;
use stowage_storage::traits::{ByteRange, ObjectStore};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";
const BUCKET: &str = "stowage-test";

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioContext {
    _container: ContainerAsync<GenericImage>,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl MinioContext {
    async fn new() -> Result<Self, String> {
        let access_key = "minio-access-key".to_string();
        let secret_key = "minio-secret-key".to_string();

        let container: ContainerAsync<GenericImage> = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key.clone())
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key.clone())
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;

        Ok(Self {
            _container: container,
            endpoint: format!("http://{host}:{port}"),
            access_key,
            secret_key,
        })
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), String> {
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "test",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .http_client(aws_smithy_http_client::Builder::new().build_http())
            .endpoint_url(self.endpoint.clone())
            .force_path_style(true)
            .build();

        Client::from_conf(config)
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;
        Ok(())
    }
}

struct S3TestHarness {
    context: MinioContext,
    backend: S3Backend,
}

impl S3TestHarness {
    async fn new() -> Result<Self, String> {
        let context = MinioContext::new().await?;
        context.create_bucket(BUCKET).await?;

        let backend = backend_for(&context, BUCKET)?;

        Ok(Self {
            context,
            backend,
        })
    }
}

fn backend_for(context: &MinioContext, bucket: &str) -> Result<S3Backend, String> {
    let mut settings = CacheSettings::new(bucket, "us-east-1");
    settings.endpoint_url = Some(context.endpoint.clone());
    settings.access_key_id = Some(context.access_key.clone());
    settings.secret_access_key = Some(context.secret_key.clone());
    settings.use_path_style = true;

    S3Backend::new(&settings).map_err(|e| format!("failed to create S3 backend: {e}"))
}

macro_rules! harness_or_skip {
    () => {{
        if should_skip_s3_tests() {
            return;
        }
        match S3TestHarness::new().await {
            Ok(harness) => harness,
            Err(err) => {
                eprintln!("Skipping S3 test: {err}");
                return;
            }
        }
    }};
}

#[tokio::test]
async fn test_s3_streamed_put_head_and_offset_get() {
    let harness = harness_or_skip!();
    let backend = &harness.backend;
    let key = "cache/blobs/streamed";

    backend.health_check().await.unwrap();

    let data = seeded_bytes(11, 6 * 1024 * 1024 + 17);
    let written = backend
        .put(key, chunked_stream(data.clone(), 1024 * 1024))
        .await
        .unwrap();
    assert_eq!(written as usize, data.len());

    let meta = backend.head(key).await.unwrap();
    assert_eq!(meta.size as usize, data.len());
    assert!(meta.last_modified.is_some());

    let offset = data.len() - 1024;
    let mut stream = backend.get(key, offset as u64).await.unwrap();
    let mut tail = Vec::new();
    while let Some(chunk) = stream.next().await {
        tail.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(&tail[..], &data[offset..]);

    assert!(backend.head("cache/blobs/missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_s3_empty_put() {
    let harness = harness_or_skip!();
    let backend = &harness.backend;

    let written = backend.put_bytes("empty", Bytes::new()).await.unwrap();
    assert_eq!(written, 0);
    assert_eq!(backend.head("empty").await.unwrap().size, 0);
}

#[tokio::test]
async fn test_s3_copy_replace_metadata() {
    let harness = harness_or_skip!();
    let backend = &harness.backend;
    let key = "cache/blobs/sha256:touched";

    backend
        .put_bytes(key, Bytes::from_static(b"touch me"))
        .await
        .unwrap();
    let metadata = HashMap::from([("updated-at".to_string(), "2024-01-01T00:00:00Z".to_string())]);
    backend.copy_replace_metadata(key, &metadata).await.unwrap();

    assert_eq!(
        backend.get_bytes(key).await.unwrap(),
        Bytes::from_static(b"touch me")
    );
}

#[tokio::test]
async fn test_s3_multipart_copy_onto_itself() {
    let harness = harness_or_skip!();
    let backend = &harness.backend;
    let key = "cache/blobs/multipart";
    let part = 5 * 1024 * 1024u64;

    let data = seeded_bytes(5, (part + 1000) as usize);
    backend.put_bytes(key, data.clone()).await.unwrap();

    let upload_id = backend.create_multipart(key).await.unwrap();
    let first = backend
        .upload_part_copy(key, &upload_id, 1, ByteRange::new(0, part - 1).unwrap())
        .await
        .unwrap();
    let second = backend
        .upload_part_copy(
            key,
            &upload_id,
            2,
            ByteRange::new(part, data.len() as u64 - 1).unwrap(),
        )
        .await
        .unwrap();
    backend
        .complete_multipart(key, &upload_id, &[first, second])
        .await
        .unwrap();

    assert_eq!(backend.get_bytes(key).await.unwrap(), data);

    let aborted = backend.create_multipart(key).await.unwrap();
    backend.abort_multipart(key, &aborted).await.unwrap();
}

#[tokio::test]
async fn test_s3_missing_bucket_is_not_a_missing_key() {
    let harness = harness_or_skip!();

    let err = harness.backend.get("cache/manifests/absent", 0).await.err().unwrap();
    assert!(err.is_not_found(), "missing key should be NotFound: {err}");

    let wrong = backend_for(&harness.context, "no-such-bucket").unwrap();
    let err = wrong.get("cache/manifests/buildkit", 0).await.err().unwrap();
    assert!(!err.is_not_found(), "missing bucket must not read as a cold cache: {err}");
}
