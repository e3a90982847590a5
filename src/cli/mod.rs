//! CLI commands implementation.

mod console_report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;

use crate::config::Config;
use crate::pdf::PopplerDecoder;
use crate::pipeline::{
    events, CancelFlag, IngestOptions, PipelineServices, StreamingPipeline,
};
use crate::services::ocr::OcrRequestOptions;
use crate::services::{HttpEmbeddingClient, HttpObjectStore, HttpOcrClient, QdrantHttpStore};

#[derive(Parser)]
#[command(name = "pagedex")]
#[command(about = "Multimodal PDF ingestion pipeline for visual retrieval indexes")]
#[command(version)]
pub struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = "pagedex.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init,

    /// Ingest one or more PDFs into the retrieval index
    Ingest {
        /// PDF files to ingest
        #[arg(required = true)]
        pdfs: Vec<PathBuf>,
        /// Override the target collection
        #[arg(long)]
        collection: Option<String>,
        /// Override pages per batch
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Disable OCR for this run
        #[arg(long)]
        no_ocr: bool,
        /// Skip the embedding/collection dimension preflight
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Check availability of external tools and services
    Check,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init_config(&cli.config),
        Commands::Ingest {
            pdfs,
            collection,
            batch_size,
            no_ocr,
            skip_preflight,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(collection) = collection {
                config.vector_store.collection = collection;
            }
            if let Some(batch_size) = batch_size {
                config.ingestion.batch_size = batch_size;
            }
            if no_ocr {
                config.ocr.enabled = false;
            }
            config.validate()?;
            ingest(config, pdfs, skip_preflight).await
        }
        Commands::Check => {
            let config = load_config(&cli.config)?;
            check(config).await
        }
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        tracing::info!("No config file at {}; using defaults", path.display());
        Ok(Config::default())
    }
}

fn init_config(path: &PathBuf) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("Config file {} already exists", path.display());
    }
    let rendered =
        toml::to_string_pretty(&Config::default()).context("Failed to render default config")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!(
        "  {} Wrote default config to {}",
        style("✓").green(),
        path.display()
    );
    Ok(())
}

fn build_services(config: &Config) -> PipelineServices {
    let embedder = Arc::new(HttpEmbeddingClient::new(
        &config.embedding.endpoint,
        Duration::from_secs(config.embedding.request_timeout_seconds),
    ));
    let ocr = config.ocr.enabled.then(|| {
        Arc::new(HttpOcrClient::new(
            &config.ocr.endpoint,
            OcrRequestOptions {
                mode: config.ocr.mode.clone(),
                task: config.ocr.task.clone(),
                include_grounding: config.ocr.include_grounding,
                include_images: config.ocr.include_images,
            },
            Duration::from_secs(config.ocr.request_timeout_seconds),
        )) as Arc<dyn crate::services::OcrClient>
    });
    let object_store = Arc::new(HttpObjectStore::new(
        &config.object_store.endpoint,
        config.object_store.public_base(),
        &config.object_store.bucket,
        Duration::from_secs(config.object_store.request_timeout_seconds),
    ));
    let vector_store = Arc::new(QdrantHttpStore::new(
        &config.vector_store.endpoint,
        Duration::from_secs(config.vector_store.request_timeout_seconds),
    ));

    PipelineServices {
        decoder: Arc::new(PopplerDecoder::new(config.ingestion.decode_dpi)),
        embedder,
        ocr,
        object_store,
        vector_store,
    }
}

async fn ingest(config: Config, pdfs: Vec<PathBuf>, skip_preflight: bool) -> anyhow::Result<()> {
    let services = build_services(&config);
    let pipeline = StreamingPipeline::new(services, config)?;

    if skip_preflight {
        tracing::warn!("Skipping embedding/collection dimension preflight");
    } else {
        pipeline.preflight().await?;
    }

    // Ctrl-C requests cooperative cancellation; the pipeline stops at the
    // next page boundary.
    let cancel = CancelFlag::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  {} Cancellation requested...", style("!").yellow());
            cancel_signal.cancel();
        }
    });

    for pdf in pdfs {
        let filename = pdf
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| pdf.display().to_string());
        let document_id = uuid::Uuid::new_v4().to_string();

        let (event_tx, event_rx) = events::channel();
        let renderer = tokio::spawn(console_report::render_events(event_rx));

        let result = pipeline
            .ingest(
                &pdf,
                &filename,
                &document_id,
                IngestOptions {
                    job_id: None,
                    cancel: cancel.clone(),
                    progress: None,
                    events: event_tx,
                },
            )
            .await;
        let _ = renderer.await;

        match result {
            Ok(report) => {
                println!(
                    "  {} {} indexed: {} pages in {:.1}s ({:.1} pages/sec)",
                    style("✓").green(),
                    report.filename,
                    report.total_pages,
                    report.elapsed.as_secs_f64(),
                    report.pages_per_second()
                );
            }
            Err(err) if err.is_cancelled() => {
                println!("  {} Ingestion cancelled", style("✗").yellow());
                return Ok(());
            }
            Err(err) => {
                println!("  {} {} failed: {}", style("✗").red(), filename, err);
                return Err(err.into());
            }
        }
    }

    Ok(())
}

async fn check(config: Config) -> anyhow::Result<()> {
    println!("{}", style("External tools").bold());
    for (tool, available) in PopplerDecoder::check_tools() {
        print_status(tool, available, "install poppler-utils");
    }

    println!("\n{}", style("Services").bold());
    let embedder = HttpEmbeddingClient::new(
        &config.embedding.endpoint,
        Duration::from_secs(10),
    );
    print_status(
        &format!("embedding ({})", config.embedding.endpoint),
        embedder.is_available().await,
        "is the embedding service running?",
    );

    if config.ocr.enabled {
        let ocr = HttpOcrClient::new(
            &config.ocr.endpoint,
            OcrRequestOptions::default(),
            Duration::from_secs(10),
        );
        print_status(
            &format!("ocr ({})", config.ocr.endpoint),
            ocr.is_available().await,
            "is the OCR service running?",
        );
    } else {
        println!("  {} ocr disabled", style("-").dim());
    }

    let store = HttpObjectStore::new(
        &config.object_store.endpoint,
        config.object_store.public_base(),
        &config.object_store.bucket,
        Duration::from_secs(10),
    );
    print_status(
        &format!("object store ({})", config.object_store.endpoint),
        store.is_available().await,
        "is the object store running?",
    );

    let vectors = QdrantHttpStore::new(&config.vector_store.endpoint, Duration::from_secs(10));
    print_status(
        &format!("vector store ({})", config.vector_store.endpoint),
        vectors.is_available().await,
        "is the vector store running?",
    );

    Ok(())
}

fn print_status(name: &str, available: bool, hint: &str) {
    if available {
        println!("  {} {}", style("✓").green(), name);
    } else {
        println!("  {} {} ({})", style("✗").red(), name, style(hint).dim());
    }
}
