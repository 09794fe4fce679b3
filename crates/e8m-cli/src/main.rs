use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use e8m_core::{ConsolidationPolicy, EngineConfig, MemoryStore, MoodState, NodeId};
use e8m_store::{CONFIG_FILE, DATABASE_FILE, Store, default_base_dir, load_config};

#[derive(Parser)]
#[command(name = "e8m", about = "E8 lattice memory engine CLI")]
struct Cli {
    /// Data directory (defaults to $E8M_DATA_DIR, then ~/.e8mind)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest embeddings from JSON (array of arrays) or JSONL files
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Creation time in unix milliseconds (defaults to now)
        #[arg(long)]
        at: Option<u64>,
    },

    /// Retrieve the best-scoring memories for an embedding
    Query {
        /// Query embedding as a JSON array
        #[arg(long, conflicts_with = "file")]
        embedding: Option<String>,

        /// File holding the query embedding as a JSON array
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(short, long, default_value_t = 5)]
        k: usize,

        /// Attention breadth in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        breadth: f64,

        /// Curvature bias in [-1, 1]
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        curvature: f64,

        /// Novelty drive in [0, 1]
        #[arg(long, default_value_t = 0.0)]
        novelty: f64,

        /// Evaluation time in unix milliseconds (defaults to now)
        #[arg(long)]
        at: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Merge dense clusters
    Consolidate {
        /// Density threshold (defaults to the configured pressure_threshold)
        #[arg(long)]
        pressure: Option<f64>,
    },

    /// Regenerate seeds from a summary node's lineage
    Reseed { id: NodeId },

    /// Run one policy-driven consolidation cycle
    Cycle {
        #[arg(long)]
        pressure: Option<f64>,
    },

    /// Show store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Export state to a JSON file
    Export { path: PathBuf },

    /// Import state from a JSON file
    Import { path: PathBuf },
}

struct Session {
    store: Store,
    config: EngineConfig,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("E8M_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_base_dir);
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let config =
            load_config(Some(&data_dir.join(CONFIG_FILE))).context("failed to load config")?;
        let store = Store::open(&data_dir.join(DATABASE_FILE)).context("failed to open store")?;
        Ok(Self { store, config })
    }

    fn memory(&self) -> Result<MemoryStore> {
        self.store
            .open_memory(self.config.clone())
            .context("failed to load memory state")
    }

    fn policy(&self) -> Result<ConsolidationPolicy> {
        let saved = self.store.load_policy().context("failed to load policy")?;
        Ok(saved
            .map(ConsolidationPolicy::restore)
            .unwrap_or_else(|| ConsolidationPolicy::new(&self.config.policy)))
    }

    fn save(&self, memory: &MemoryStore, policy: Option<&ConsolidationPolicy>) -> Result<()> {
        self.store.save_memory(memory).context("failed to save memory state")?;
        if let Some(policy) = policy {
            self.store
                .save_policy(&policy.save())
                .context("failed to save policy")?;
        }
        Ok(())
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let session = Session::open(&cli)?;
    match &cli.command {
        Commands::Ingest { files, at } => cmd_ingest(&session, files, *at),
        Commands::Query {
            embedding,
            file,
            k,
            breadth,
            curvature,
            novelty,
            at,
            json,
        } => {
            let query = read_query(embedding.as_deref(), file.as_deref())?;
            let mood = MoodState::new(*breadth, *curvature, *novelty)?;
            cmd_query(&session, &query, &mood, *k, *at, *json)
        }
        Commands::Consolidate { pressure } => cmd_consolidate(&session, *pressure),
        Commands::Reseed { id } => cmd_reseed(&session, *id),
        Commands::Cycle { pressure } => cmd_cycle(&session, *pressure),
        Commands::Stats { json } => cmd_stats(&session, *json),
        Commands::Export { path } => cmd_export(&session, path),
        Commands::Import { path } => cmd_import(&session, path),
    }
}

/// Accepts a JSON array of arrays or one JSON array per line.
fn parse_embeddings(content: &str) -> Result<Vec<Vec<f64>>> {
    if let Ok(batch) = serde_json::from_str::<Vec<Vec<f64>>>(content) {
        return Ok(batch);
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Vec<f64>>(line)
                .with_context(|| format!("line {}: expected a JSON array of numbers", i + 1))
        })
        .collect()
}

fn read_query(embedding: Option<&str>, file: Option<&Path>) -> Result<Vec<f64>> {
    let raw = match (embedding, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("query needs --embedding or --file"),
    };
    serde_json::from_str(raw.trim()).context("query embedding must be a JSON array of numbers")
}

fn pressure_or_default(session: &Session, pressure: Option<f64>) -> f64 {
    pressure.unwrap_or(session.config.consolidation.pressure_threshold)
}

fn cmd_ingest(session: &Session, files: &[PathBuf], at: Option<u64>) -> Result<()> {
    let memory = session.memory()?;
    let mut policy = session.policy()?;
    let mut policy_changed = false;

    for path in files {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let embeddings = parse_embeddings(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        for (i, embedding) in embeddings.iter().enumerate() {
            let result = match at {
                Some(ms) => memory.ingest_at(embedding, ms),
                None => memory.ingest(embedding),
            };
            result.with_context(|| format!("{}: embedding {}", path.display(), i))?;

            if memory.maintenance_due() {
                let pressure = session.config.consolidation.pressure_threshold;
                let report = match at {
                    Some(ms) => memory.run_cycle_at(&mut policy, pressure, ms),
                    None => memory.run_cycle(&mut policy, pressure),
                }
                .context("maintenance cycle failed")?;
                policy_changed = true;
                tracing::debug!(arm = %report.arm, "maintenance cycle ran during ingest");
            }
        }
        println!("ingested {} → {} embeddings", path.display(), embeddings.len());
    }

    session.save(&memory, policy_changed.then_some(&policy))?;
    println!("done. live={}", memory.live_count());
    Ok(())
}

fn cmd_query(
    session: &Session,
    query: &[f64],
    mood: &MoodState,
    k: usize,
    at: Option<u64>,
    json: bool,
) -> Result<()> {
    let memory = session.memory()?;
    let hits = match at {
        Some(ms) => memory.retrieve_at(query, mood, k, ms),
        None => memory.retrieve(query, mood, k),
    }
    .context("retrieval failed")?;
    session.save(&memory, None)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("(no memories found)");
    } else {
        for hit in &hits {
            println!(
                "{:>8}  score={:.4}  dist={:.4}  shell={}",
                hit.node_id, hit.score, hit.distance, hit.shell
            );
        }
    }
    Ok(())
}

fn cmd_consolidate(session: &Session, pressure: Option<f64>) -> Result<()> {
    let memory = session.memory()?;
    let events = memory
        .scan_and_merge(pressure_or_default(session, pressure))
        .context("merge pass failed")?;
    session.save(&memory, None)?;

    for event in &events {
        println!(
            "merged {} nodes in shell {} → summary {}",
            event.absorbed_ids.len(),
            event.shell,
            event.summary_id
        );
    }
    println!("merges: {}", events.len());
    Ok(())
}

fn cmd_reseed(session: &Session, id: NodeId) -> Result<()> {
    let memory = session.memory()?;
    let seeds = memory.reseed(id).context("reseed failed")?;
    session.save(&memory, None)?;

    let ids: Vec<String> = seeds.iter().map(ToString::to_string).collect();
    println!("seeds: {}", ids.join(" "));
    Ok(())
}

fn cmd_cycle(session: &Session, pressure: Option<f64>) -> Result<()> {
    let memory = session.memory()?;
    let mut policy = session.policy()?;
    let report = memory
        .run_cycle(&mut policy, pressure_or_default(session, pressure))
        .context("consolidation cycle failed")?;
    session.save(&memory, Some(&policy))?;

    println!("arm:     {}", report.arm);
    println!("merges:  {}", report.merges.len());
    println!("seeds:   {}", report.seeds.len());
    println!("reward:  {:.4}", report.reward);
    Ok(())
}

fn cmd_stats(session: &Session, json: bool) -> Result<()> {
    let memory = session.memory()?;
    let stats = memory.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("nodes:    {}", stats.node_count);
    println!("active:   {}", stats.active_count);
    println!("seeds:    {}", stats.seed_count);
    println!("merged:   {}", stats.merged_count);
    println!("edges:    {}", stats.edge_count);
    println!("merges:   {}", stats.merge_count);
    println!("reseeds:  {}", stats.reseed_count);
    for (shell, count) in &stats.shell_histogram {
        println!("shell {shell:>3}: {count}");
    }
    Ok(())
}

fn cmd_export(session: &Session, path: &Path) -> Result<()> {
    let exported = session
        .store
        .export_json_file(path)
        .with_context(|| format!("failed to export to {}", path.display()))?;
    if !exported {
        // Nothing saved yet: export the empty engine so the file is still importable.
        let json = e8m_core::export_json(&session.memory()?.snapshot())?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_import(session: &Session, path: &Path) -> Result<()> {
    let snapshot = session
        .store
        .import_json_file(path)
        .context("failed to import JSON")?;
    println!(
        "imported from {}. nodes={}, lineages={}",
        path.display(),
        snapshot.nodes.len(),
        snapshot.lineage.len()
    );
    Ok(())
}
