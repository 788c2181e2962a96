//! Command-line client for the stowage remote build cache.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_cache::{DescriptorProviderPair, ExportInput, Exporter, Importer};
use stowage_core::{CacheManifest, CacheSettings, Descriptor, Digest};
use stowage_storage::{
    DEFAULT_READ_CHUNK_SIZE, DirectoryProvider, ObjectStore, Provider, section_stream,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stowagectl")]
#[command(about = "Client for the stowage S3 build cache")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SettingsArgs {
    /// TOML config file with an [attrs] table
    #[arg(long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache attribute override, e.g. --attr bucket=my-cache (repeatable)
    #[arg(long = "attr", global = true, value_parser = config::parse_attr)]
    attrs: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload local blobs and write the cache manifest
    Push {
        /// JSON file with the manifest skeleton and blob descriptors
        #[arg(long)]
        manifest: PathBuf,
        /// Directory holding blobs as <algorithm>/<hex>
        #[arg(long)]
        blobs: PathBuf,
    },
    /// Print the manifest stored under the first configured name
    Inspect {
        /// Print only the layer and record counts
        #[arg(long, default_value_t = false)]
        summary: bool,
    },
    /// Download one blob from the cache
    Fetch {
        /// Blob digest, e.g. sha256:...
        digest: String,
        /// Output file
        out: PathBuf,
    },
    /// Check that the bucket is reachable
    Check,
}

/// Input of `stowagectl push`.
#[derive(Debug, Deserialize)]
struct PushFile {
    manifest: CacheManifest,
    #[serde(default)]
    descriptors: Vec<Descriptor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { settings, command } = Cli::parse();
    let settings = config::resolve_settings(settings.config.as_deref(), &settings.attrs)?;
    let store = stowage_storage::from_settings(&settings).context("failed to create S3 client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match command {
        Commands::Push { manifest, blobs } => {
            handle_push_command(&settings, store, &cancel, &manifest, &blobs).await
        }
        Commands::Inspect { summary } => handle_inspect_command(&settings, store, summary).await,
        Commands::Fetch { digest, out } => {
            handle_fetch_command(&settings, store, &cancel, &digest, &out).await
        }
        Commands::Check => handle_check_command(&settings, store).await,
    }
}

/// Read the push file and pair every layer blob with the local directory.
async fn load_push_input(manifest: &Path, blobs: &Path) -> Result<ExportInput> {
    let raw = tokio::fs::read(manifest)
        .await
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let PushFile {
        manifest,
        descriptors,
    } = serde_json::from_slice(&raw).context("invalid push manifest")?;

    let directory = DirectoryProvider::new(blobs);
    let mut by_digest = HashMap::with_capacity(descriptors.len());
    for desc in descriptors {
        let size = directory
            .blob_size(&desc.digest)
            .await
            .with_context(|| format!("blob {} not found in {}", desc.digest, blobs.display()))?;
        if size != desc.size {
            anyhow::bail!(
                "blob {} is {size} bytes on disk but the descriptor says {}",
                desc.digest,
                desc.size
            );
        }
        by_digest.insert(desc.digest.clone(), desc);
    }

    let provider: Arc<dyn Provider> = Arc::new(directory);
    let mut pairs = HashMap::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let desc = by_digest
            .get(&layer.blob)
            .with_context(|| format!("no descriptor for layer blob {}", layer.blob))?;
        pairs.insert(
            layer.blob.clone(),
            DescriptorProviderPair::new(desc.clone(), provider.clone()),
        );
    }

    Ok(ExportInput {
        manifest,
        descriptors: pairs,
    })
}

async fn handle_push_command(
    settings: &CacheSettings,
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    manifest: &Path,
    blobs: &Path,
) -> Result<()> {
    let input = load_push_input(manifest, blobs).await?;
    let layers = input.manifest.layers.len();

    let exporter = Exporter::new(settings, store)?;
    tracing::info!(layers, bucket = %settings.bucket, "{}", exporter.name());
    let keys = exporter.finalize(cancel, input).await?;

    for key in keys {
        println!("{key}");
    }
    Ok(())
}

async fn handle_inspect_command(
    settings: &CacheSettings,
    store: Arc<dyn ObjectStore>,
    summary: bool,
) -> Result<()> {
    let importer = Importer::new(settings, store)?;
    let chain = importer.load().await?;

    if chain.is_empty() {
        println!("No cache manifest under {:?}", importer.name());
        return Ok(());
    }

    if summary {
        let bytes: u64 = chain.blobs.values().map(|p| p.descriptor.size).sum();
        println!("Manifest: {}", importer.blobs().manifest_key(importer.name()));
        println!("Layers:   {}", chain.manifest.layers.len());
        println!("Records:  {}", chain.manifest.records.len());
        println!("Size:     {bytes} bytes");
    } else {
        println!("{}", serde_json::to_string_pretty(&chain.manifest)?);
    }
    Ok(())
}

async fn handle_fetch_command(
    settings: &CacheSettings,
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    digest: &str,
    out: &Path,
) -> Result<()> {
    let digest = Digest::parse(digest).context("invalid digest")?;
    let importer = Importer::new(settings, store)?;
    let blobs = importer.blobs();
    let key = blobs.blob_key(&digest);

    let meta = blobs
        .store()
        .head(&key)
        .await
        .with_context(|| format!("failed to look up {key}"))?;
    let reader = blobs.blob_reader(&digest, meta.size);
    let mut stream = section_stream(Box::new(reader), key.clone(), DEFAULT_READ_CHUNK_SIZE);

    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("fetch of {key} cancelled"),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.with_context(|| format!("failed to read {key}"))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    tracing::info!(key = %key, bytes = written, "blob fetched");
    println!("{} ({written} bytes) -> {}", digest, out.display());
    Ok(())
}

async fn handle_check_command(settings: &CacheSettings, store: Arc<dyn ObjectStore>) -> Result<()> {
    store
        .health_check()
        .await
        .with_context(|| format!("bucket {} is not reachable", settings.bucket))?;
    println!("Bucket {} ({}) is reachable", settings.bucket, store.backend_name());
    Ok(())
}
