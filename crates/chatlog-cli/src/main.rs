mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chatlog_codec::{
    BatchConfig, BatchDecryptor, CipherParams, DecryptOutcome, PageCodec, SecretKey,
};
use chatlog_core::{CancellationToken, Role};
use chatlog_store_sqlite::{
    ChangeWatcher, ConnectionCache, MessageQuery, RebuildReport, TimeRange, TimelineRouter,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

use crate::config::{FileConfig, Settings};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "chatlog")]
#[command(about = "Decrypt and query sharded chat databases")]
struct Cli {
    /// YAML file with data_dir, work_dir, key and workers
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the encrypted databases
    #[arg(long, global = true, env = "CHATLOG_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory holding the decrypted databases
    #[arg(long, global = true, env = "CHATLOG_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// 32-byte key as 64 hex characters
    #[arg(long, global = true, env = "CHATLOG_KEY", hide_env_values = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decrypt one database file
    Decrypt(DecryptArgs),
    /// Decrypt every database under the data directory into the work directory
    DecryptDir(DecryptDirArgs),
    /// Check a key against the first page of a database
    VerifyKey(VerifyKeyArgs),
    /// List the message shards found in the work directory
    Shards,
    /// Show which shards cover a conversation and time range
    Resolve(RangeArgs),
    /// Read messages for a conversation across shards
    Messages(MessagesArgs),
    /// Locate the database(s) serving a role
    Find(FindArgs),
    /// Rebuild the shard index whenever new message shards appear
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct CipherArgs {
    /// PBKDF2 rounds for the encryption key
    #[arg(long, default_value_t = CipherParams::default().kdf_iterations)]
    kdf_iterations: u32,
}

impl CipherArgs {
    fn params(&self) -> CipherParams {
        CipherParams::default().with_kdf_iterations(self.kdf_iterations)
    }
}

#[derive(Debug, Args)]
struct DecryptArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    cipher: CipherArgs,
}

#[derive(Debug, Args)]
struct DecryptDirArgs {
    /// Files decrypted concurrently (default 8)
    #[arg(long)]
    workers: Option<usize>,
    #[command(flatten)]
    cipher: CipherArgs,
}

#[derive(Debug, Args)]
struct VerifyKeyArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[command(flatten)]
    cipher: CipherArgs,
}

#[derive(Debug, Args)]
struct RangeArgs {
    #[arg(long)]
    talker: String,
    /// RFC3339 timestamp, YYYY-MM-DD or Unix seconds; defaults to the epoch
    #[arg(long)]
    start: Option<String>,
    /// RFC3339 timestamp, YYYY-MM-DD or Unix seconds; defaults to now
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Args)]
struct MessagesArgs {
    #[command(flatten)]
    range: RangeArgs,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct FindArgs {
    #[arg(long)]
    role: RoleArg,
    /// List every match instead of the first
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long, default_value_t = 1000)]
    debounce_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Message,
    Contact,
    Image,
    Video,
    File,
    Voice,
    Session,
}

impl RoleArg {
    fn into_role(self) -> Role {
        match self {
            Self::Message => Role::Message,
            Self::Contact => Role::Contact,
            Self::Image => Role::Image,
            Self::Video => Role::Video,
            Self::File => Role::File,
            Self::Voice => Role::Voice,
            Self::Session => Role::Session,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    // stdout carries JSON only; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let workers = match &cli.command {
        Command::DecryptDir(args) => args.workers,
        _ => None,
    };
    let settings = Settings::resolve(file, cli.data_dir, cli.work_dir, cli.key, workers);

    match cli.command {
        Command::Decrypt(args) => run_decrypt(&args, &settings),
        Command::DecryptDir(args) => run_decrypt_dir(&args, &settings).await,
        Command::VerifyKey(args) => run_verify_key(&args, &settings),
        Command::Shards => run_shards(&settings),
        Command::Resolve(args) => run_resolve(&args, &settings),
        Command::Messages(args) => run_messages(&args, &settings),
        Command::Find(args) => run_find(&args, &settings),
        Command::Watch(args) => run_watch(&args, &settings).await,
    }
}

fn secret_key(settings: &Settings) -> Result<SecretKey> {
    SecretKey::from_hex(settings.key()?).context("invalid key")
}

fn outcome_json(outcome: DecryptOutcome) -> Value {
    match outcome {
        DecryptOutcome::AlreadyPlaintext => {
            json!({ "outcome": "already_plaintext", "pages": null })
        }
        DecryptOutcome::Decrypted { pages } => json!({ "outcome": "decrypted", "pages": pages }),
    }
}

fn run_decrypt(args: &DecryptArgs, settings: &Settings) -> Result<()> {
    let key = secret_key(settings)?;
    let codec = PageCodec::new(args.cipher.params())?;
    let outcome = codec
        .decrypt_file(&args.input, &args.out, &key, &CancellationToken::new())
        .with_context(|| format!("failed to decrypt {}", args.input.display()))?;

    let mut payload = outcome_json(outcome);
    payload["source"] = json!(args.input);
    payload["output"] = json!(args.out);
    emit_json(payload)
}

async fn run_decrypt_dir(args: &DecryptDirArgs, settings: &Settings) -> Result<()> {
    let key = secret_key(settings)?;
    let src_root = settings.data_dir()?;
    let dst_root = settings.work_dir()?;
    let decryptor = BatchDecryptor::new(BatchConfig {
        max_concurrent: settings.workers,
        params: args.cipher.params(),
    })?;

    let jobs = BatchDecryptor::plan(src_root, dst_root)
        .with_context(|| format!("failed to scan {}", src_root.display()))?;
    if jobs.is_empty() {
        return Err(anyhow!("no database files under {}", src_root.display()));
    }

    let cancel = CancellationToken::new();
    let report = tokio::select! {
        report = decryptor.run(jobs, &key, &cancel) => report,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Err(anyhow!("interrupted"));
        }
    };

    let failed: Vec<Value> = report
        .failed
        .iter()
        .map(|failure| json!({ "source": failure.job.src, "error": failure.error.to_string() }))
        .collect();
    let succeeded: Vec<Value> = report
        .succeeded
        .iter()
        .map(|success| {
            let mut entry = outcome_json(success.outcome);
            entry["source"] = json!(success.job.src);
            entry["output"] = json!(success.job.dst);
            entry
        })
        .collect();
    let payload = json!({
        "succeeded": succeeded,
        "failed": failed,
        "cancelled": report.cancelled,
    });

    report.into_result().context("every file failed to decrypt")?;
    emit_json(payload)
}

fn run_verify_key(args: &VerifyKeyArgs, settings: &Settings) -> Result<()> {
    let key = secret_key(settings)?;
    let codec = PageCodec::new(args.cipher.params())?;
    let valid = codec
        .verify_key(&args.input, &key)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    emit_json(json!({ "source": args.input, "valid": valid }))
}

fn load_router(settings: &Settings) -> Result<(TimelineRouter, RebuildReport)> {
    let base = settings.work_dir()?;
    let router = TimelineRouter::new(base, Arc::new(ConnectionCache::new()))?;
    let report = router
        .rebuild_index(&CancellationToken::new())
        .with_context(|| format!("failed to index {}", base.display()))?;
    Ok((router, report))
}

fn run_shards(settings: &Settings) -> Result<()> {
    let (router, report) = load_router(settings)?;
    let index = router.snapshot();
    emit_json(json!({
        "shards": index.shards(),
        "built_at": index.built_at(),
        "skipped": report.skipped,
    }))
}

fn time_range(args: &RangeArgs) -> Result<TimeRange> {
    let start = match &args.start {
        Some(raw) => parse_time(raw)?,
        None => DateTime::<Utc>::default(),
    };
    let end = match &args.end {
        Some(raw) => parse_time(raw)?,
        None => Utc::now(),
    };
    if start >= end {
        return Err(anyhow!("start {start} is not before end {end}"));
    }
    Ok(TimeRange::new(start, end))
}

fn run_resolve(args: &RangeArgs, settings: &Settings) -> Result<()> {
    let range = time_range(args)?;
    let (router, _) = load_router(settings)?;
    let targets = router.resolve(range, &args.talker);
    emit_json(json!({ "range": range, "targets": targets }))
}

fn run_messages(args: &MessagesArgs, settings: &Settings) -> Result<()> {
    let range = time_range(&args.range)?;
    let (router, _) = load_router(settings)?;
    let mut query = MessageQuery::new(args.range.talker.clone(), range).with_offset(args.offset);
    if let Some(limit) = args.limit {
        query = query.with_limit(limit);
    }
    let fan_out = router.query_messages(&query);
    emit_json(json!({ "messages": fan_out.data, "skipped": fan_out.skipped }))
}

fn run_find(args: &FindArgs, settings: &Settings) -> Result<()> {
    let router = TimelineRouter::new(settings.work_dir()?, Arc::new(ConnectionCache::new()))?;
    let role = args.role.into_role();
    let paths = if args.all {
        router.find_all_by_role(role)
    } else {
        router.find_one_by_role(role).into_iter().collect()
    };
    emit_json(json!({ "role": role, "found": !paths.is_empty(), "paths": paths }))
}

async fn run_watch(args: &WatchArgs, settings: &Settings) -> Result<()> {
    let (router, report) = load_router(settings)?;
    tracing::info!("Watching {} ({} shard(s))", router.base_dir().display(), report.loaded);

    let mut watcher = ChangeWatcher::new(Arc::new(router))?
        .with_debounce(Duration::from_millis(args.debounce_ms));
    let mut events = watcher.start()?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                // One compact JSON object per line.
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.stop();
    Ok(())
}

/// Accepts RFC3339, a bare `YYYY-MM-DD` (midnight UTC) or Unix seconds.
fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    if let Ok(secs) = value.parse::<i64>() {
        if let Some(parsed) = DateTime::from_timestamp(secs, 0) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("invalid timestamp: {value} (expected RFC3339, YYYY-MM-DD or Unix seconds)"))
}
