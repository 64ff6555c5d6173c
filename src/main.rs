// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use telecloud::group::ChunkGroup;
use telecloud::integrity::sha256_file;
use telecloud::prelude::*;
use telecloud::progress::format_bytes;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "telecloud", version, about = "Chunked file transfer engine")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, env = "TELECLOUD_CONFIG", default_value = "telecloud.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload files, splitting the large ones into chunks.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Folder the uploaded files belong to.
        #[arg(long)]
        parent: Option<i64>,
    },
    /// Rebuild a chunked file from its group id.
    Download {
        group_id: GroupId,
        /// Output path, defaults to the original file name.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Expected SHA-256 of the rebuilt file, as printed by `upload`.
        #[arg(long)]
        sha256: Option<String>,
    },
    /// List stored chunk groups and whether they are complete.
    Groups,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config)?;
    let store = Arc::new(
        LocalStore::open(config.store_root.clone(), &config.catalog_path)
            .await
            .context("failed to open the chunk store")?,
    );

    match cli.command {
        Command::Upload { paths, parent } => upload(&config, store, paths, parent).await,
        Command::Download {
            group_id,
            out,
            sha256,
        } => download(&config, store, group_id, out, sha256).await,
        Command::Groups => groups(&store).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,telecloud=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn upload(
    config: &EngineConfig,
    store: Arc<LocalStore>,
    paths: Vec<PathBuf>,
    parent: Option<i64>,
) -> Result<()> {
    let slicer = config.slicer()?;
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = SourceFile::load(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let digest = sha256_file(path)
            .await
            .with_context(|| format!("failed to hash {}", path.display()))?;
        println!("{}: sha256 {digest}", file.name);
        if let Some(notice) = slicer.describe(&file) {
            println!("{}: {notice}", file.name);
        }
        files.push(file);
    }

    let registry = TransferRegistry::new();
    let coordinator = UploadCoordinator::new(store, registry.clone())
        .with_slicer(slicer)
        .with_limiter(config.limiter())
        .with_cleanup(config.cleanup_incomplete_groups);

    let batch = coordinator.prepare(files, parent).await?;
    let task_ids = batch.task_ids();

    let canceller = registry.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Cancelling {} transfers...", task_ids.len());
            for id in task_ids {
                canceller.cancel(id).await;
            }
        }
    });

    let monitor = ProgressMonitor::spawn(registry.clone(), config.tick_interval());
    let printer = tokio::spawn(print_progress(monitor.subscribe()));
    let report = coordinator.execute(batch).await;
    monitor.stop().await;
    let _ = printer.await;
    interrupt.abort();

    for file in &report.files {
        println!(
            "{} [{}] {}/{} units",
            file.file_name,
            file.status,
            file.completed(),
            file.units.len()
        );
        if let Some(group_id) = file.group_id {
            println!("  group {group_id}");
        }
        for unit in file.failed() {
            println!(
                "  {} failed: {}",
                unit.name,
                unit.error.as_deref().unwrap_or("unknown error")
            );
        }
        if file.cleaned_up {
            println!("  stored chunks removed");
        }
    }

    if !report.is_success() {
        bail!("some uploads did not complete");
    }
    Ok(())
}

async fn download(
    config: &EngineConfig,
    store: Arc<LocalStore>,
    group_id: GroupId,
    out: Option<PathBuf>,
    sha256: Option<String>,
) -> Result<()> {
    let registry = TransferRegistry::new();
    let reassembler = Reassembler::new(store, registry.clone()).with_limiter(config.limiter());
    let mut request = reassembler.group_request(group_id).await?;
    if let Some(digest) = &sha256 {
        request = request.with_expected_sha256(digest.clone());
    }

    let canceller = registry.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for task in canceller.tasks().await {
                canceller.cancel(task.id).await;
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut last = -1.0;
        while let Some(event) = rx.recv().await {
            match event {
                ReassemblyEvent::Overall(percent) if percent - last >= 5.0 || percent >= 100.0 => {
                    println!("[PROGRESS] {percent:.0}%");
                    last = percent;
                }
                ReassemblyEvent::Chunk {
                    name,
                    status: status @ (TaskStatus::Error | TaskStatus::Aborted),
                    error,
                    ..
                } => {
                    println!("  {name} [{status}] {}", error.unwrap_or_default());
                }
                _ => {}
            }
        }
    });

    let result = reassembler.reassemble(request, Some(tx)).await;
    interrupt.abort();
    let _ = printer.await;
    let file = result?;

    let out = out.unwrap_or_else(|| PathBuf::from(&file.name));
    file.write_to(&out).await?;
    if let Some(expected) = &sha256 {
        let written = sha256_file(&out).await?;
        if !written.eq_ignore_ascii_case(expected.trim()) {
            bail!("{} does not match the expected sha256 after writing", out.display());
        }
        println!("Verified sha256 {written}");
    }
    println!(
        "Saved {} ({}) to {}",
        file.name,
        format_bytes(file.size()),
        out.display()
    );
    Ok(())
}

async fn groups(store: &LocalStore) -> Result<()> {
    let groups = store.catalog().list_groups().await?;
    if groups.is_empty() {
        println!("No chunk groups stored.");
        return Ok(());
    }

    for (group_id, entries) in groups {
        let Some(first) = entries.first() else {
            continue;
        };
        let group = ChunkGroup {
            original_name: first.original_name.clone(),
            chunks: entries.iter().map(|e| e.descriptor()).collect(),
        };
        let size = group.size().map(format_bytes).unwrap_or_else(|| "?".into());
        let state = if group.is_complete() { "complete" } else { "incomplete" };
        println!("{group_id}  {}  {size}  {state}", group.display_name());
    }
    Ok(())
}

async fn print_progress(mut reports: tokio::sync::watch::Receiver<ProgressReport>) {
    while reports.changed().await.is_ok() {
        let report = reports.borrow_and_update().clone();
        let overall: u64 = report.tasks.iter().map(|t| t.total).sum();
        println!(
            "[PROGRESS] {} active, {} of {} at {}",
            report.active,
            format_bytes(report.total_loaded),
            format_bytes(overall),
            report.rate_label()
        );
    }
}
