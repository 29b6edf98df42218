use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use warc_ledger::{
    Env, ExecutionTimeLedger, LedgerConfig, OrgQuotas, OrgQuotasPatch, OrgStore, Organization,
    QuotaGuard, QuotaUpdateLog, SqliteStore, telemetry,
};

const DEFAULT_CONFIG: &str = "warc-ledger.toml";
const DEFAULT_DB: &str = "warc-ledger.sqlite";

#[derive(Debug, Parser)]
#[command(name = "warc-ledger", about = "Org quota ledger over a SQLite store")]
struct Cli {
    /// TOML config; `warc-ledger.toml` is read when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dotenv file layered over the process environment.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
    /// SQLite database path; overrides `[sqlite] path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the schema.
    Init,
    OrgCreate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: Option<String>,
        #[command(flatten)]
        quotas: QuotaArgs,
    },
    OrgShow {
        #[arg(long)]
        org: String,
    },
    /// Record crawl runtime for the current month.
    RecordUsage {
        #[arg(long)]
        org: String,
        #[arg(long)]
        seconds: u64,
        /// Count as plain usage instead of execution time.
        #[arg(long)]
        not_exec: bool,
    },
    SetQuotas {
        #[arg(long)]
        org: String,
        #[command(flatten)]
        quotas: QuotaArgs,
    },
    QuotaStatus {
        #[arg(long)]
        org: String,
    },
    /// Print the effective settings after env and config layering.
    ConfigShow,
}

#[derive(Debug, Args)]
struct QuotaArgs {
    #[arg(long)]
    storage_quota: Option<u64>,
    #[arg(long)]
    max_exec_minutes: Option<u64>,
    #[arg(long)]
    max_concurrent_crawls: Option<u64>,
    #[arg(long)]
    max_pages_per_crawl: Option<u64>,
    #[arg(long)]
    gifted_minutes: Option<u64>,
    #[arg(long)]
    extra_minutes: Option<u64>,
}

impl QuotaArgs {
    fn to_patch(&self) -> OrgQuotasPatch {
        OrgQuotasPatch {
            storage_quota: self.storage_quota,
            max_exec_minutes_per_month: self.max_exec_minutes,
            max_concurrent_crawls: self.max_concurrent_crawls,
            max_pages_per_crawl: self.max_pages_per_crawl,
            extra_exec_minutes: self.extra_minutes,
            gifted_exec_minutes: self.gifted_minutes,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<LedgerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(LedgerConfig::load(path)?),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok(LedgerConfig::load(&default)?)
            } else {
                Ok(LedgerConfig::default())
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let env = Env::load(&cli.env_file)?;
    let _telemetry = telemetry::init_tracing("warc-ledger", &config.logging)?;

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.sqlite.path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    let store = Arc::new(SqliteStore::new(&db_path));
    store.init().await?;

    match cli.command {
        Command::Init => {
            tracing::info!(path = %db_path.display(), "schema ready");
        }
        Command::OrgCreate {
            id,
            name,
            owner,
            quotas,
        } => {
            let mut org = Organization::new(id, name);
            if let Some(owner) = owner {
                org = org.with_owner(owner);
            }
            org.quotas = quotas.to_patch().apply_to(&OrgQuotas::default());
            org.gifted_exec_seconds_available = org.quotas.gifted_exec_minutes.saturating_mul(60);
            org.extra_exec_seconds_available = org.quotas.extra_exec_minutes.saturating_mul(60);
            store.insert_org(&org).await?;
            print_json(&org)?;
        }
        Command::OrgShow { org } => {
            print_json(&store.get_org(&org).await?)?;
        }
        Command::RecordUsage {
            org,
            seconds,
            not_exec,
        } => {
            let ledger = ExecutionTimeLedger::new(store.clone());
            let allocation = ledger.record_usage(&org, seconds, !not_exec).await?;
            print_json(&allocation)?;
        }
        Command::SetQuotas { org, quotas } => {
            let log = QuotaUpdateLog::new(store.clone())
                .with_retention(config.quota_updates.retention);
            let updated = log.apply_quota_update(&org, &quotas.to_patch()).await?;
            print_json(&updated.quotas)?;
        }
        Command::QuotaStatus { org } => {
            let guard = QuotaGuard::new(store.clone());
            print_json(&guard.usage_report(&org).await?)?;
        }
        Command::ConfigShow => {
            print_json(&serde_json::json!({
                "sqlitePath": db_path,
                "presignDurationSeconds": config.presign_duration_seconds(&env)?,
                "quotaUpdateRetention": config.quota_updates.retention,
                "storage": config.storage,
            }))?;
        }
    }
    Ok(())
}
