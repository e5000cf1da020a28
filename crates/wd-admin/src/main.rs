use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wd_proto::Role;
use wd_store::{JsonFileRecordStore, RecordStore};
use wd_trust::{Gate, TracingNotifier, TrustConfig, TrustCore};

const APP_QUALIFIER: &str = "com";
const APP_ORG: &str = "warden";
const APP_NAME: &str = "warden";

#[derive(Parser, Debug)]
#[command(name = "wd-admin", version, about = "Warden administrator tool", long_about = None)]
struct Cli {
    /// Directory holding records.json (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON trust configuration; absent fields use defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Device access requests
    Requests {
        #[command(subcommand)]
        action: RequestAction,
    },
    /// Account inspection
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Role table
    Roles {
        #[command(subcommand)]
        action: RoleAction,
    },
    /// Release elapsed lockouts, expire stale requests, drop expired messages
    Sweep,
}

#[derive(Subcommand, Debug)]
enum RequestAction {
    /// List pending requests, oldest first
    List,
    Approve {
        request_id: String,
        /// Administrator performing the approval
        #[arg(long)]
        admin: String,
    },
    Deny {
        request_id: String,
        #[arg(long)]
        admin: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    /// Passcode, lockout and device state of one account
    Status { user_id: String },
}

#[derive(Subcommand, Debug)]
enum RoleAction {
    Grant {
        user_id: String,
        /// admin | oversight
        role: Role,
        #[arg(long)]
        by: Option<String>,
    },
    Revoke {
        user_id: String,
        role: Role,
        #[arg(long)]
        by: Option<String>,
    },
}

fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WARDEN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn open_core(cli: &Cli) -> Result<TrustCore> {
    let config = match &cli.config {
        Some(path) => TrustConfig::load(path)?,
        None => TrustConfig::default(),
    };
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let records = data_dir.join("records.json");
    info!(path = %records.display(), "opening record store");
    let store: Arc<dyn RecordStore> = Arc::new(JsonFileRecordStore::open(&records)?);
    Ok(TrustCore::with_keyring(config, store, Arc::new(TracingNotifier))?)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let core = open_core(&cli)?;

    match cli.command {
        Commands::Requests { action } => match action {
            RequestAction::List => {
                let pending = core.pending_device_requests().await?;
                if pending.is_empty() {
                    println!("no pending device requests");
                }
                for r in pending {
                    println!(
                        "{}  {} ({})  device={}  requested={}  identity={:?}",
                        r.request_id,
                        r.username,
                        r.user_id,
                        r.new_device_id,
                        r.requested_at.to_rfc3339(),
                        r.identity_check
                    );
                }
            }
            RequestAction::Approve { request_id, admin } => {
                let r = core.approve_device(&request_id, &admin).await?;
                println!("approved: {} now authorized on {}", r.user_id, r.new_device_id);
            }
            RequestAction::Deny {
                request_id,
                admin,
                reason,
            } => {
                let r = core.deny_device(&request_id, &admin, reason).await?;
                println!("denied: {} stays blocked on {}", r.user_id, r.new_device_id);
            }
        },
        Commands::Account {
            action: AccountAction::Status { user_id },
        } => {
            let profile = core.profile(&user_id).await?;
            let status = core.passcode_status(&user_id).await?;
            let gate = match status.gate {
                Gate::Allow { remaining_attempts } => json!({ "state": "active", "remainingAttempts": remaining_attempts }),
                Gate::LockedOut { until } => json!({ "state": "locked_out", "until": until }),
                Gate::Destroyed => json!({ "state": "destroyed" }),
            };
            print_json(&json!({
                "userId": profile.user_id,
                "username": profile.username,
                "fingerprint": profile.public_key.map(|k| k.fingerprint()),
                "device": profile.authorized_device(),
                "passcode": {
                    "set": status.set,
                    "enabled": status.enabled,
                    "version": status.version,
                },
                "escrowed": profile.encrypted_private_key_backup.is_some(),
                "sentinel": gate,
                "failedAttempts": status.failed_attempts,
                "totalFailedAttempts": status.total_failed_attempts,
                "roles": core.roles().roles_of(&user_id).await?,
            }))?;
        }
        Commands::Roles { action } => {
            let grant = match action {
                RoleAction::Grant { user_id, role, by } => core.grant_role(&user_id, role, by.as_deref()).await?,
                RoleAction::Revoke { user_id, role, by } => core.roles().revoke(&user_id, role, by.as_deref()).await?,
            };
            print_json(&serde_json::to_value(&grant)?)?;
        }
        Commands::Sweep => {
            let report = core.sweep().await?;
            println!(
                "messages removed: {}, chats removed: {}, lockouts released: {}, requests expired: {}",
                report.messages_removed, report.chats_removed, report.lockouts_released, report.requests_expired
            );
        }
    }
    Ok(())
}
