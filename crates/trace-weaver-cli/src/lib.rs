//! `tw`: ingest development and pipeline sources, correlate them into cases,
//! and query graphs, conformance and triplet rewards. Every command prints
//! pretty JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use trace_weaver_core::{
    now_utc, parse_rfc3339_utc, EventType, Payload, TraceError, TripletId, TripletStore,
    WeaverConfig,
};
use trace_weaver_ingest::{HistoryAdapter, SessionAdapter, SourceAdapter, SpanAdapter};
use trace_weaver_mining::{GraphKind, ReferenceModel};
use trace_weaver_store_sqlite::{EventInput, SqliteTraceStore, SqliteTripletStore};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tw")]
#[command(about = "TraceWeaver: correlate sessions, commits and spans into process traces")]
pub struct Cli {
    #[arg(long, default_value = "./trace_weaver.sqlite3")]
    db: PathBuf,

    /// JSON file overriding the default runtime configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse sources, correlate and persist the events.
    Ingest(IngestArgs),
    /// Resolve stored events that have no case yet.
    Correlate,
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Traces {
        #[command(subcommand)]
        command: TracesCommand,
    },
    Triplet {
        #[command(subcommand)]
        command: Box<TripletCommand>,
    },
    Graph(GraphArgs),
    Conformance(ConformanceArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    spans: Vec<PathBuf>,
    #[arg(long)]
    sessions: Vec<PathBuf>,
    #[arg(long)]
    history: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
    Submit(EventsSubmitArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long = "case")]
    case_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct EventsSubmitArgs {
    #[arg(long = "type", default_value = "pipeline.activity")]
    event_type: String,
    #[arg(long)]
    activity: String,
    #[arg(long)]
    resource: String,
    /// RFC3339 timestamp; defaults to now.
    #[arg(long)]
    at: Option<String>,
    #[arg(long = "case")]
    case_hint: Option<String>,
    #[arg(long)]
    source_id: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long, default_value = "{}")]
    attributes: String,
}

#[derive(Debug, Subcommand)]
pub enum TracesCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum TripletCommand {
    Record(TripletRecordArgs),
    Reward(TripletRewardArgs),
    SequenceReward(TripletSequenceRewardArgs),
    Show(TripletShowArgs),
    History(TripletHistoryArgs),
}

#[derive(Debug, Args)]
pub struct TripletRecordArgs {
    #[arg(long)]
    sequence: String,
    #[arg(long, default_value = "{}")]
    state: String,
    #[arg(long, default_value = "{}")]
    action: String,
}

#[derive(Debug, Args)]
pub struct TripletRewardArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    value: f64,
    #[arg(long)]
    source: String,
}

#[derive(Debug, Args)]
pub struct TripletSequenceRewardArgs {
    #[arg(long)]
    sequence: String,
    #[arg(long)]
    value: f64,
    #[arg(long, default_value = "terminal")]
    source: String,
}

#[derive(Debug, Args)]
pub struct TripletShowArgs {
    #[arg(long)]
    sequence: String,
}

#[derive(Debug, Args)]
pub struct TripletHistoryArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct GraphArgs {
    /// `directly-follows` or `causal`.
    #[arg(long, default_value = "directly-follows")]
    kind: String,
}

#[derive(Debug, Args)]
pub struct ConformanceArgs {
    /// Reference model, YAML or `.json`.
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SequenceRewardOutput<'a> {
    sequence_id: &'a str,
    updated: usize,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second install (tests embedding the CLI) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when configuration, store setup or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Command::Conformance(ConformanceArgs {
        deadline_ms: Some(deadline_ms),
        ..
    }) = &cli.command
    {
        config.replay_deadline_ms = Some(*deadline_ms);
        config
            .validate()
            .map_err(|err| anyhow!("invalid --deadline-ms: {err}"))?;
    }

    match cli.command {
        Command::Triplet { command } => {
            let store = SqliteTripletStore::open(&cli.db)?;
            store.migrate()?;
            run_triplet(*command, &store)
        }
        command => {
            let mut store = SqliteTraceStore::open(&cli.db)?.with_config(config);
            store.migrate()?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a non-triplet command against an open trace store.
///
/// # Errors
/// Returns an error when parsing, persistence or derivation fails.
pub fn run_command(command: Command, store: &mut SqliteTraceStore) -> Result<()> {
    match command {
        Command::Ingest(args) => {
            let adapters = build_adapters(&args)?;
            let sources: Vec<&dyn SourceAdapter> =
                adapters.iter().map(|adapter| adapter.as_ref()).collect();
            let summary = store.ingest(&sources)?;
            print_json(&summary)
        }
        Command::Correlate => print_json(&store.correlate()?),
        Command::Events { command } => match *command {
            EventsCommand::List(args) => print_json(&store.list_events(args.case_id.as_deref())?),
            EventsCommand::Submit(args) => {
                let input = event_input(args)?;
                print_json(&store.submit_event(&input)?)
            }
        },
        Command::Traces {
            command: TracesCommand::List,
        } => print_json(&store.load_traces()?),
        Command::Graph(args) => {
            let kind = GraphKind::parse(&args.kind).ok_or_else(|| {
                anyhow!(
                    "unknown graph kind {}; expected directly-follows or causal",
                    args.kind
                )
            })?;
            print_json(&store.get_graph(kind)?)
        }
        Command::Conformance(args) => {
            let model = ReferenceModel::load(&args.model).map_err(contract_error)?;
            print_json(&store.get_conformance_report(&model)?)
        }
        Command::Triplet { .. } => Err(anyhow!(
            "internal dispatch error: triplet commands run against the triplet store"
        )),
    }
}

/// Executes a triplet command against any [`TripletStore`].
///
/// # Errors
/// Returns an error carrying the contract error code when the store rejects the call.
pub fn run_triplet(command: TripletCommand, store: &dyn TripletStore) -> Result<()> {
    match command {
        TripletCommand::Record(args) => {
            let state = parse_payload(&args.state, "state")?;
            let action = parse_payload(&args.action, "action")?;
            let triplet_id = store
                .record(&args.sequence, state, action)
                .map_err(contract_error)?;
            print_json(&store.get_triplet(triplet_id).map_err(contract_error)?)
        }
        TripletCommand::Reward(args) => {
            let triplet_id = parse_triplet_id(&args.id)?;
            let outcome = store
                .assign_reward(triplet_id, args.value, &args.source)
                .map_err(contract_error)?;
            print_json(&outcome)
        }
        TripletCommand::SequenceReward(args) => {
            let updated = store
                .assign_sequence_reward(&args.sequence, args.value, &args.source)
                .map_err(contract_error)?;
            print_json(&SequenceRewardOutput {
                sequence_id: &args.sequence,
                updated,
            })
        }
        TripletCommand::Show(args) => {
            print_json(&store.get_sequence(&args.sequence).map_err(contract_error)?)
        }
        TripletCommand::History(args) => {
            let triplet_id = parse_triplet_id(&args.id)?;
            print_json(&store.reward_history(triplet_id).map_err(contract_error)?)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<WeaverConfig> {
    match path {
        Some(path) => {
            let config = WeaverConfig::load(path).map_err(contract_error)?;
            debug!(event = "config_loaded", path = %path.display());
            Ok(config)
        }
        None => Ok(WeaverConfig::default()),
    }
}

fn build_adapters(args: &IngestArgs) -> Result<Vec<Box<dyn SourceAdapter>>> {
    if args.spans.is_empty() && args.sessions.is_empty() && args.history.is_empty() {
        return Err(anyhow!(
            "ingest needs at least one of --spans, --sessions or --history"
        ));
    }

    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();
    for path in &args.spans {
        adapters.push(Box::new(SpanAdapter::from_path(path)?));
    }
    for path in &args.sessions {
        adapters.push(Box::new(SessionAdapter::from_path(path)?));
    }
    for path in &args.history {
        adapters.push(Box::new(HistoryAdapter::from_path(path)?));
    }
    Ok(adapters)
}

fn event_input(args: EventsSubmitArgs) -> Result<EventInput> {
    let event_type = EventType::parse(&args.event_type)
        .ok_or_else(|| anyhow!("unknown event type: {}", args.event_type))?;
    let timestamp = match args.at.as_deref() {
        Some(raw) => parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --at: {err}"))?,
        None => now_utc(),
    };

    Ok(EventInput {
        case_hint: args.case_hint,
        event_type,
        timestamp,
        activity: args.activity,
        resource: args.resource,
        attributes: parse_payload(&args.attributes, "attributes")?,
        parent: args.parent,
        source_record_id: args.source_id,
        references: args.references.into_iter().collect(),
    })
}

fn parse_payload(raw: &str, field: &str) -> Result<Payload> {
    Payload::from_json_str(raw).with_context(|| format!("--{field} must be a JSON object"))
}

fn parse_triplet_id(raw: &str) -> Result<TripletId> {
    TripletId::parse(raw).map_err(contract_error)
}

fn contract_error(err: TraceError) -> anyhow::Error {
    anyhow!("{}: {err}", err.code())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}
