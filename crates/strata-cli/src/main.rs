use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;

use strata_core::delta::{read_delta, ReadMode};
use strata_core::storage::{FileStore, SqliteStore};
use strata_core::{
    inspect_delta, BackendConfig, DeltaController, DeltaStore, DeltaSummary, Envelope,
    PersistenceConfig,
};

/// Strata CLI - Inspect and manage persisted agent state
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage backend (overrides the config file)
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Directory root for the file backend, database file for sqlite
    #[arg(short, long, value_name = "PATH")]
    path: Option<PathBuf>,

    /// Agent whose state to operate on
    #[arg(short, long, default_value = "agent")]
    agent: String,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    File,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sequence numbers and a summary of every delta
    Inspect {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode one delta as JSON
    Dump {
        /// Delta number
        #[arg(long)]
        delta: u32,
    },

    /// Replay the delta chain and report the live objects
    Rehydrate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete all persisted state of the agent
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(&cli)?;
    match &config.backend {
        BackendConfig::File { root } => {
            let store = FileStore::open(root, &cli.agent)?;
            run(store, &cli.agent, config.clone(), &cli.command)
        }
        BackendConfig::Sqlite { path } => {
            let store = SqliteStore::open(path, cli.agent.clone())?;
            run(store, &cli.agent, config.clone(), &cli.command)
        }
        BackendConfig::Memory | BackendConfig::Noop => {
            bail!("the configured backend keeps no state to operate on")
        }
    }
}

/// Config file (or defaults), with the command-line backend applied on top
fn load_config(cli: &Cli) -> anyhow::Result<PersistenceConfig> {
    let config = match &cli.config {
        Some(path) => PersistenceConfig::from_file(path)
            .with_context(|| format!("Loading config '{}'", path.display()))?,
        None => PersistenceConfig::default(),
    };

    let backend = match (cli.backend, &cli.path) {
        (Some(Backend::File), path) => BackendConfig::File {
            root: path.clone().unwrap_or_else(|| PathBuf::from(".strata")),
        },
        (Some(Backend::Sqlite), path) => BackendConfig::Sqlite {
            path: path
                .clone()
                .unwrap_or_else(|| PathBuf::from(".strata/strata.db")),
        },
        (None, Some(path)) => match config.backend {
            BackendConfig::Sqlite { .. } => BackendConfig::Sqlite { path: path.clone() },
            _ => BackendConfig::File { root: path.clone() },
        },
        (None, None) => config.backend.clone(),
    };

    let config = config.with_backend(backend);
    config.validate()?;
    Ok(config)
}

fn run<S: DeltaStore>(
    store: S,
    agent: &str,
    config: PersistenceConfig,
    command: &Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { json } => {
            let sequence = store.read_sequence_numbers()?;
            let summaries = summarize(&store)?;

            if *json {
                let out = serde_json::json!({
                    "agent": agent,
                    "sequence": sequence,
                    "deltas": summaries,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }

            match sequence {
                Some(sequence) => println!("AGENT: {}  SEQUENCE: {}", agent, sequence),
                None => println!("AGENT: {}  (nothing committed)", agent),
            }
            for s in &summaries {
                let saved_at = Utc
                    .timestamp_millis_opt(s.saved_at_ms)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "  delta {:>6}  {}  objects={:<5} bytes={:<8} next_ref={:<6} {}{} blake3={}",
                    s.delta,
                    saved_at,
                    s.object_count,
                    s.payload_bytes,
                    s.next_reference_id,
                    if s.consolidated { "consolidated " } else { "" },
                    if s.checksum_valid { "" } else { "CORRUPT " },
                    &hex::encode(s.payload_checksum)[..16],
                );
            }
        }
        Commands::Dump { delta } => {
            let mut input = store.open_input(*delta)?;
            let record = read_delta(&mut input, *delta, ReadMode::Final, false)
                .with_context(|| format!("Decoding delta {}", delta))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Rehydrate { json } => {
            let controller = DeltaController::new(agent, store, config);
            let mut live = Envelope::new();
            let Some(state) = controller.rehydrate(&mut live)? else {
                println!("No persisted state for agent {}", agent);
                return Ok(());
            };

            let mut kinds: BTreeMap<String, usize> = BTreeMap::new();
            for object in live.objects() {
                *kinds.entry(object.kind().to_string()).or_insert(0) += 1;
            }

            if *json {
                let subscribers: Vec<_> = state
                    .subscriber_states
                    .iter()
                    .map(|s| s.subscriber.clone())
                    .collect();
                let out = serde_json::json!({
                    "agent": agent,
                    "sequence": state.sequence,
                    "active": state.active,
                    "kinds": kinds,
                    "repaired_links": state.repaired,
                    "undistributed": state.undistributed.len(),
                    "subscribers": subscribers,
                    "message_state_bytes": state.message_state.as_ref().map(Vec::len),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("AGENT: {}  SEQUENCE: {}", agent, state.sequence);
                println!("ACTIVE OBJECTS: {}", state.active);
                for (kind, count) in &kinds {
                    println!("  {:<24} {}", kind, count);
                }
                println!("UNDISTRIBUTED ENVELOPES: {}", state.undistributed.len());
                println!("SUBSCRIBERS: {}", state.subscriber_states.len());
                if state.repaired > 0 {
                    println!("REPAIRED LINKS: {}", state.repaired);
                }
            }
        }
        Commands::Clear { yes } => {
            if !*yes {
                bail!("refusing to delete the state of agent {} without --yes", agent);
            }
            DeltaController::new(agent, store, config).clear()?;
            println!("Cleared persisted state of agent {}", agent);
        }
    }

    Ok(())
}

fn summarize<S: DeltaStore>(store: &S) -> anyhow::Result<Vec<DeltaSummary>> {
    let mut summaries = Vec::new();
    for delta in store.list_deltas()? {
        let mut input = store.open_input(delta)?;
        let summary = inspect_delta(&mut input, delta)
            .with_context(|| format!("Inspecting delta {}", delta))?;
        store.close_input(delta, input)?;
        summaries.push(summary);
    }
    Ok(summaries)
}
