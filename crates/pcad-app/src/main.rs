//! PCAD session runner
//!
//! Replicates a document from a frontend replica to a kernel replica and
//! rebuilds every object through the shape cache.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pcad_core::{DocumentEdit, DocumentSnapshot};

mod config;
mod session;

use config::AppConfig;
use session::Session;

#[derive(Parser)]
#[command(name = "pcad")]
#[command(about = "Sync a parametric CAD document and rebuild it through the shape cache", long_about = None)]
struct Cli {
    /// RON document to load (a built-in sample when omitted)
    document: Option<PathBuf>,

    /// RON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the kernel replica's document here after syncing
    #[arg(short, long)]
    save: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let default_filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| "pcad=info,pcad_core=info,pcad_sync=info,pcad_cad=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let document = match &cli.document {
        Some(path) => DocumentSnapshot::load(path)
            .with_context(|| format!("Failed to load document {}", path.display()))?,
        None => session::sample_document(),
    };
    tracing::info!("Loaded document with {} objects", document.len());

    let mut session = Session::open(&config)?;
    for object in document.iter() {
        session.edit(&DocumentEdit::Upsert(object.clone()))?;
    }
    let delivered = session.pump()?;
    tracing::info!(
        "Delivered {} messages, synced: {}, peers: {:?}",
        delivered,
        session.is_synced(),
        session.kernel_peers()
    );
    tracing::info!(
        "Frontend replica holds {} objects, kernel replica {}",
        session.frontend_snapshot().len(),
        session.kernel_snapshot().len()
    );

    let kernel = pcad_cad::default_kernel();
    let report = session.rebuild(kernel.as_ref())?;
    tracing::info!(
        "First build: {} built, {} declined",
        report.built,
        report.declined
    );
    let report = session.rebuild(kernel.as_ref())?;
    tracing::info!(
        "Second build: {} built, {} declined, cache {:?}",
        report.built,
        report.declined,
        report.stats
    );

    if let Some(path) = &cli.save {
        session
            .kernel_snapshot()
            .save(path)
            .with_context(|| format!("Failed to save document {}", path.display()))?;
        tracing::info!("Saved kernel replica to {}", path.display());
    }

    session.close();
    Ok(())
}
