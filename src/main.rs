//! doc-preview
//!
//! Renders first-page previews of local documents through the full
//! scheduler + worker pipeline and writes them next to the inputs (or into
//! `--out-dir`) as `<name>.preview.jpg`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doc_preview::{CacheKey, ConversionRoute, PreviewConfig, PreviewService, RenderError, SourceRef};

#[derive(Parser, Debug)]
#[command(name = "doc-preview")]
#[command(version, about = "Render first-page previews of documents")]
struct Cli {
    /// Documents to preview
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for the generated previews (defaults to each input's directory)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// JPEG quality (1-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Convert on the blocking pool instead of isolated workers
    #[arg(long)]
    inline: bool,

    /// Warm up the workers before converting
    #[arg(long)]
    warmup: bool,

    /// Print pipeline statistics as JSON when done
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_preview=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = PreviewConfig::from_env();
    if let Some(quality) = cli.quality {
        config.worker.quality = quality.clamp(1, 100);
    }
    if cli.inline {
        config.route = ConversionRoute::Inline;
    }

    tracing::info!("Starting doc-preview v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        route = ?config.route,
        workers = config.supervisor.pool_size,
        max_concurrency = config.scheduler.max_concurrency,
        max_bytes = config.worker.max_bytes,
        "Preview pipeline configured"
    );

    let service = PreviewService::start(config).context("Failed to start preview service")?;
    if cli.warmup {
        service.warmup().await;
    }

    let started = Instant::now();
    let (converted, failed) =
        render_until(&service, &cli.inputs, cli.out_dir.as_deref(), shutdown_signal()).await;

    if cli.stats {
        println!("{}", serde_json::to_string_pretty(&service.stats())?);
    }
    service.shutdown();

    tracing::info!(
        converted,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Done"
    );
    if failed > 0 {
        anyhow::bail!("{} of {} previews failed", failed, cli.inputs.len());
    }
    Ok(())
}

/// Render every input, or stop early when `shutdown` resolves. Returns
/// (written, not written); previews written before a shutdown still count.
async fn render_until(
    service: &PreviewService,
    inputs: &[PathBuf],
    out_dir: Option<&Path>,
    shutdown: impl Future<Output = ()>,
) -> (usize, usize) {
    let written = AtomicUsize::new(0);
    tokio::select! {
        _ = render_all(service, inputs, out_dir, &written) => {}
        _ = shutdown => {
            for input in inputs {
                service.cancel(&key_for(input));
            }
        }
    }
    let written = written.load(Ordering::SeqCst);
    (written, inputs.len() - written)
}

async fn render_all(service: &PreviewService, inputs: &[PathBuf], out_dir: Option<&Path>, written: &AtomicUsize) {
    let tickets: Vec<_> = inputs
        .iter()
        .map(|input| {
            let ticket = service.request(key_for(input), SourceRef::from_path(input));
            (input, ticket)
        })
        .collect();

    futures::future::join_all(tickets.into_iter().map(|(input, ticket)| async move {
        let outcome = match ticket.wait().await {
            Ok(handle) => match handle.image() {
                Some(image) => write_preview(input, out_dir, &image.bytes).await,
                None => Err(anyhow::anyhow!("preview was released before it could be written")),
            },
            Err(RenderError::Failed(failure)) => Err(anyhow::anyhow!(failure)),
            Err(RenderError::Cancelled) => Err(anyhow::anyhow!("cancelled")),
        };
        match outcome {
            Ok(()) => {
                written.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => tracing::error!(input = %input.display(), "Preview failed: {}", e),
        }
    }))
    .await;
}

async fn write_preview(input: &Path, out_dir: Option<&Path>, bytes: &[u8]) -> anyhow::Result<()> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let output = dir.join(format!("{}.preview.jpg", stem));

    tokio::fs::write(&output, bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(output = %output.display(), bytes = bytes.len(), "Wrote preview");
    Ok(())
}

fn key_for(input: &Path) -> CacheKey {
    CacheKey::new(input.to_string_lossy())
}

/// Ctrl+C / SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling outstanding previews...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, cancelling outstanding previews...");
        },
    }
}
