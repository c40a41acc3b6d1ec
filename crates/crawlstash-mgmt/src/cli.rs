use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crawlstash_dedup::{ArtifactKind, DedupStore, JsonMetadataStore, StoreConfig};
use std::path::{Path, PathBuf};

/// Operator CLI for a crawlstash store.
#[derive(Parser)]
#[command(name = "crawlstash")]
#[command(about = "crawlstash dedup store administration", long_about = None)]
pub struct Cli {
    /// Store configuration file (.toml or .json)
    #[arg(short, long, env = "CRAWLSTASH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store root directory, overriding the configuration file
    #[arg(short, long, env = "CRAWLSTASH_ROOT")]
    pub root: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the recovery scan and print its findings
    Check {
        /// Re-hash every owner payload
        #[arg(long)]
        verify_payloads: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print record and artifact counts per kind
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove orphan artifacts and markers
    CleanOrphans {
        /// Report what would be removed without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Move raw pages that hold PDF, zip or binary data out of the store
    IsolateMisfiled {
        /// Report what would be isolated without moving anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Ingest one file
    Ingest {
        /// Source URL of the payload
        #[arg(long)]
        source: String,
        /// Artifact kind (html, text, markdown, document)
        #[arg(long, value_parser = parse_kind)]
        kind: ArtifactKind,
        /// File holding the payload
        #[arg(long)]
        file: PathBuf,
        /// Original name (defaults to the last URL path segment)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the metadata record of a source URL
    Show {
        /// Source URL
        #[arg(long)]
        source: String,
        /// Artifact kind
        #[arg(long, value_parser = parse_kind)]
        kind: ArtifactKind,
    },
    /// Salvage the parseable entries of a damaged metadata file
    RepairMetadata,
}

fn parse_kind(s: &str) -> Result<ArtifactKind, String> {
    s.parse::<ArtifactKind>().map_err(|e| e.to_string())
}

impl Cli {
    /// Execute the parsed command.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Check { verify_payloads, json } => check(config, verify_payloads, json).await,
            Command::Stats { json } => stats(config, json).await,
            Command::CleanOrphans { dry_run } => clean_orphans(config, dry_run).await,
            Command::IsolateMisfiled { dry_run } => isolate_misfiled(config, dry_run).await,
            Command::Ingest {
                ref source,
                kind,
                ref file,
                ref name,
            } => ingest(config, source, kind, file, name.as_deref()).await,
            Command::Show { ref source, kind } => show(config, source, kind).await,
            Command::RepairMetadata => repair_metadata(config).await,
        }
    }

    /// Configuration file (if any) with the `--root` override applied.
    pub fn load_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => StoreConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        Ok(config)
    }
}

/// Maintenance commands report on a damaged store instead of refusing it.
async fn open_lenient(mut config: StoreConfig) -> Result<DedupStore> {
    config.strict_recovery = false;
    let root = config.root.clone();
    DedupStore::open(config)
        .await
        .with_context(|| format!("opening store at {}", root.display()))
}

async fn check(mut config: StoreConfig, verify_payloads: bool, json: bool) -> Result<()> {
    config.verify_payloads |= verify_payloads;
    let store = open_lenient(config).await?;
    let report = store.recovery_report();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for finding in &report.findings {
            println!("{}", finding);
        }
        println!(
            "Replayed: {}  Records: {}  Index entries: {}  Quarantined: {}",
            report.replayed, report.records, report.index_entries, report.quarantined
        );
        println!("Errors: {}  Warnings: {}", report.errors(), report.warnings());
    }

    if !report.is_clean() {
        anyhow::bail!("store has {} integrity error(s)", report.errors());
    }
    Ok(())
}

async fn stats(config: StoreConfig, json: bool) -> Result<()> {
    let store = open_lenient(config).await?;
    let stats = store.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!(
        "{:<12} {:>8} {:>8} {:>10} {:>10} {:>14}",
        "KIND", "RECORDS", "OWNERS", "DUPLICATES", "ARTIFACTS", "BYTES"
    );
    for (kind, k) in &stats.kinds {
        println!(
            "{:<12} {:>8} {:>8} {:>10} {:>10} {:>14}",
            kind.as_str(),
            k.records,
            k.owners,
            k.duplicates,
            k.artifacts,
            k.stored_bytes
        );
    }
    println!(
        "Total: {} records, {} duplicates, {} bytes stored, {} index entries, {} quarantined",
        stats.records(),
        stats.duplicates(),
        stats.stored_bytes(),
        stats.index_entries,
        stats.quarantined
    );
    Ok(())
}

async fn clean_orphans(config: StoreConfig, dry_run: bool) -> Result<()> {
    let store = open_lenient(config).await?;
    let report = store.clean_orphans(dry_run).await?;
    for finding in &report.removed {
        println!("{}{}", if dry_run { "would remove: " } else { "removed: " }, finding.issue);
    }
    println!(
        "{} orphan(s) {}",
        report.removed.len(),
        if dry_run { "found" } else { "removed" }
    );
    let remaining = store.recovery_report().errors();
    if remaining > 0 {
        tracing::warn!(errors = remaining, "Integrity errors remain; run `check` for details");
    }
    Ok(())
}

async fn isolate_misfiled(config: StoreConfig, dry_run: bool) -> Result<()> {
    let store = open_lenient(config).await?;
    let report = store.isolate_misfiled(dry_run).await?;
    for finding in &report.isolated {
        println!("{}{}", if dry_run { "would isolate: " } else { "isolated: " }, finding.issue);
    }
    println!(
        "{} misfiled page(s) {}, {} record(s) {}",
        report.isolated.len(),
        if dry_run { "found" } else { "isolated" },
        report.records_removed,
        if dry_run { "affected" } else { "removed" }
    );
    Ok(())
}

async fn ingest(
    config: StoreConfig,
    source: &str,
    kind: ArtifactKind,
    file: &Path,
    name: Option<&str>,
) -> Result<()> {
    let store = DedupStore::open(config).await.context("opening store")?;
    let reader = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let decision = store.ingest_reader(source, kind, reader, name).await?;
    println!("{}", decision);
    Ok(())
}

async fn show(config: StoreConfig, source: &str, kind: ArtifactKind) -> Result<()> {
    let store = open_lenient(config).await?;
    match store.record(source, kind)? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("no {} record for {}", kind.as_str(), source),
    }
    Ok(())
}

async fn repair_metadata(config: StoreConfig) -> Result<()> {
    let root = config.root.clone();
    let report = tokio::task::spawn_blocking(move || JsonMetadataStore::salvage(&root)).await??;
    match &report.backup {
        Some(backup) => {
            println!("Backed up damaged metadata to {}", backup.display());
            println!("Recovered {} record(s)", report.recovered);
            for key in &report.dropped {
                println!("dropped: {}", key);
            }
        }
        None => println!("Metadata is intact ({} records)", report.recovered),
    }
    Ok(())
}
