//! Citadel CLI - Command line interface for the secrets vault.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use citadel_vault::backup::list_backups;
use citadel_vault::{
    AuditFilter, Environment, InitOptions, SecretOptions, SessionCache, UpdateOptions, Vault,
    VaultError, VaultState, DEFAULT_AUTO_LOCK_MINUTES,
};

#[derive(Parser)]
#[command(name = "citadel")]
#[command(about = "Citadel - local encrypted secrets vault")]
#[command(version)]
struct Cli {
    /// Vault directory
    #[arg(long, env = "CITADEL_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init {
        /// Overwrite an existing vault
        #[arg(long)]
        force: bool,
        /// Auto-lock timeout in minutes
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Unlock the vault and cache a session
    Unlock {
        /// Auto-lock timeout in minutes
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Lock the vault and drop the cached session
    Lock,
    /// Store a new secret
    Add {
        /// Secret key (A-Z, 0-9, underscore)
        key: String,
        /// Secret value (prompted when omitted)
        value: Option<String>,
        /// Environment: dev, staging, prod, all
        #[arg(short, long, default_value = "all")]
        env: String,
        /// Description
        #[arg(short, long)]
        description: Option<String>,
        /// Comma-separated tags
        #[arg(short, long)]
        tags: Option<String>,
    },
    /// Read a secret value
    Get {
        /// Secret key
        key: String,
        /// Environment (falls back to `all`)
        #[arg(short, long, default_value = "all")]
        env: String,
        /// Show the full record
        #[arg(long)]
        details: bool,
    },
    /// List secrets (no values shown)
    List {
        /// Environment filter
        #[arg(short, long)]
        env: Option<String>,
    },
    /// Overwrite an existing secret
    Update {
        /// Secret key
        key: String,
        /// New value (prompted when omitted)
        value: Option<String>,
        /// Environment
        #[arg(short, long, default_value = "all")]
        env: String,
        /// New description
        #[arg(short, long)]
        description: Option<String>,
        /// Comma-separated tags
        #[arg(short, long)]
        tags: Option<String>,
    },
    /// Delete a secret
    #[command(visible_aliases = ["rm", "remove"])]
    Delete {
        /// Secret key
        key: String,
        /// Environment
        #[arg(short, long, default_value = "all")]
        env: String,
        /// Delete across every environment
        #[arg(long)]
        all_envs: bool,
    },
    /// Rotate a secret value across environments
    Rotate {
        /// Secret key
        key: String,
        /// New value (prompted when omitted)
        value: Option<String>,
        /// Environments to skip
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Search keys and descriptions
    Search {
        /// Substring to look for (case-sensitive)
        query: String,
    },
    /// Change the master password
    ChangePassword,
    /// Show or prune the audit log
    Audit {
        /// Restrict to one secret key
        #[arg(long)]
        key: Option<String>,
        /// Restrict to one action
        #[arg(long)]
        action: Option<String>,
        /// Entries to show
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: i64,
        /// Keep only the newest N entries
        #[arg(long)]
        prune: Option<i64>,
    },
    /// Report vault status
    Health,
    /// Write a backup of the vault
    Backup {
        /// Destination file (defaults into the backups directory)
        output: Option<PathBuf>,
        /// Skip encryption
        #[arg(long)]
        plain: bool,
        /// List existing backups instead
        #[arg(long)]
        list: bool,
    },
    /// Replace the vault from a backup
    Restore {
        /// Backup file
        input: PathBuf,
    },
    /// Export secrets to an encrypted portable bundle
    Export {
        /// Destination file
        output: PathBuf,
        /// Environment filter
        #[arg(short, long)]
        env: Option<String>,
    },
    /// Import secrets from a bundle (collisions overwrite)
    Import {
        /// Bundle file
        input: PathBuf,
    },
}

struct Paths {
    db: PathBuf,
    session: PathBuf,
    backups: PathBuf,
}

fn resolve_paths(dir: Option<PathBuf>) -> anyhow::Result<Paths> {
    let root = match dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("cannot determine home directory; pass --dir")?
            .join(".secrets"),
    };
    Ok(Paths {
        db: root.join("vault.db"),
        session: root.join("session.json"),
        backups: root.join("backups"),
    })
}

fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    let password = rpassword::prompt_password(prompt).context("failed to read password")?;
    if password.is_empty() {
        return Err(VaultError::EmptyValue.into());
    }
    Ok(password)
}

fn prompt_new_password(prompt: &str) -> anyhow::Result<String> {
    let first = prompt_password(prompt)?;
    let second = prompt_password("Confirm password: ")?;
    if first != second {
        return Err(VaultError::PasswordMismatch.into());
    }
    Ok(first)
}

fn value_or_prompt(value: Option<String>, prompt: &str) -> anyhow::Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(VaultError::EmptyValue.into()),
        None => prompt_password(prompt),
    }
}

fn parse_env(env: &str) -> anyhow::Result<Environment> {
    Ok(env.parse::<Environment>()?)
}

fn split_tags(tags: Option<String>) -> Option<Vec<String>> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Unlocks via the cached session when possible, otherwise prompts.
async fn open_unlocked(paths: &Paths) -> anyhow::Result<Vault> {
    let vault = Vault::open(&paths.db);
    if !vault.is_initialized().await {
        return Err(VaultError::NotInitialized.into());
    }

    let cache = SessionCache::new(&paths.session);
    if let Some(key) = cache.load_session()? {
        match vault.unlock_with_session(key).await {
            Ok(()) => {
                let _ = cache.extend_session(DEFAULT_AUTO_LOCK_MINUTES);
                return Ok(vault);
            },
            Err(VaultError::SessionInvalid(_)) => {
                // Stale (master password changed); fall through to a prompt.
                cache.delete_session()?;
            },
            Err(e) => return Err(e.into()),
        }
    }

    let password = prompt_password("Master password: ")?;
    vault.unlock(&password, None).await?;
    vault
        .cache_session(&cache, DEFAULT_AUTO_LOCK_MINUTES)
        .await?;

    Ok(vault)
}

fn format_timestamp(millis: i64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => millis.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = resolve_paths(cli.dir)?;

    match cli.command {
        Commands::Init { force, timeout } => {
            let password = prompt_new_password("New master password: ")?;
            let vault = Vault::open(&paths.db);
            vault
                .initialize(
                    &password,
                    InitOptions {
                        force,
                        auto_lock_minutes: timeout,
                    },
                )
                .await?;
            println!("Vault initialized at {}", paths.db.display());
        },
        Commands::Unlock { timeout } => {
            let vault = Vault::open(&paths.db);
            let password = prompt_password("Master password: ")?;
            vault.unlock(&password, timeout).await?;
            vault
                .cache_session(
                    &SessionCache::new(&paths.session),
                    timeout.unwrap_or(DEFAULT_AUTO_LOCK_MINUTES),
                )
                .await?;
            println!("Vault unlocked");
        },
        Commands::Lock => {
            let vault = Vault::open(&paths.db);
            vault.lock().await;
            SessionCache::new(&paths.session).delete_session()?;
            println!("Vault locked");
        },
        Commands::Add {
            key,
            value,
            env,
            description,
            tags,
        } => {
            let environment = parse_env(&env)?;
            let value = value_or_prompt(value, "Secret value: ")?;
            let vault = open_unlocked(&paths).await?;
            let secret = vault
                .add_secret(
                    &key,
                    &value,
                    environment,
                    SecretOptions {
                        description,
                        tags: split_tags(tags),
                        expires_at: None,
                    },
                )
                .await?;
            println!("Stored {} [{}]", secret.key, secret.environment);
        },
        Commands::Get { key, env, details } => {
            let environment = parse_env(&env)?;
            let vault = open_unlocked(&paths).await?;
            if details {
                match vault.get_secret_with_details(&key, environment).await? {
                    Some(found) => {
                        let s = &found.secret;
                        println!("Key:         {}", s.key);
                        println!("Environment: {}", s.environment);
                        println!("Value:       {}", found.value);
                        if let Some(desc) = &s.description {
                            println!("Description: {desc}");
                        }
                        if !s.tags.is_empty() {
                            println!("Tags:        {}", s.tags.join(", "));
                        }
                        println!("Created:     {}", format_timestamp(s.created_at));
                        println!("Updated:     {}", format_timestamp(s.updated_at));
                    },
                    None => bail!("secret not found: {key}"),
                }
            } else {
                match vault.get_secret(&key, environment).await? {
                    Some(value) => println!("{value}"),
                    None => bail!("secret not found: {key}"),
                }
            }
        },
        Commands::List { env } => {
            let environment = env.as_deref().map(parse_env).transpose()?;
            let vault = open_unlocked(&paths).await?;
            let secrets = vault.list_secrets(environment).await?;
            if secrets.is_empty() {
                println!("No secrets stored");
            } else {
                for secret in secrets {
                    let desc = secret.description.as_deref().unwrap_or("");
                    println!("{:<32} {:<8} {}", secret.key, secret.environment.to_string(), desc);
                }
            }
        },
        Commands::Update {
            key,
            value,
            env,
            description,
            tags,
        } => {
            let environment = parse_env(&env)?;
            let value = value_or_prompt(value, "New value: ")?;
            let vault = open_unlocked(&paths).await?;
            vault
                .update_secret(
                    &key,
                    &value,
                    environment,
                    UpdateOptions {
                        description,
                        tags: split_tags(tags),
                    },
                )
                .await?;
            println!("Updated {key} [{environment}]");
        },
        Commands::Delete { key, env, all_envs } => {
            let vault = open_unlocked(&paths).await?;
            if all_envs {
                let removed = vault.delete_secret_all_envs(&key).await?;
                println!("Deleted {removed} row(s) for {key}");
            } else {
                let environment = parse_env(&env)?;
                vault.delete_secret(&key, environment).await?;
                println!("Deleted {key} [{environment}]");
            }
        },
        Commands::Rotate {
            key,
            value,
            exclude,
        } => {
            let exclude: Vec<Environment> = exclude
                .iter()
                .map(|e| parse_env(e))
                .collect::<Result<_, _>>()?;
            let value = value_or_prompt(value, "New value: ")?;
            let vault = open_unlocked(&paths).await?;
            let rotated = vault.rotate_secret(&key, &value, &exclude).await?;
            println!("Rotated {rotated} row(s) for {key}");
        },
        Commands::Search { query } => {
            let vault = open_unlocked(&paths).await?;
            let secrets = vault.search_secrets(&query).await?;
            if secrets.is_empty() {
                println!("No matches");
            } else {
                for secret in secrets {
                    println!("{:<32} {}", secret.key, secret.environment);
                }
            }
        },
        Commands::ChangePassword => {
            let old = prompt_password("Current master password: ")?;
            let new = prompt_new_password("New master password: ")?;
            let vault = Vault::open(&paths.db);
            vault.change_master_password(&old, &new).await?;
            // Any cached session now holds a stale key.
            SessionCache::new(&paths.session).delete_session()?;
            println!("Master password changed");
        },
        Commands::Audit {
            key,
            action,
            limit,
            offset,
            prune,
        } => {
            let vault = open_unlocked(&paths).await?;
            if let Some(keep) = prune {
                let removed = vault.prune_audit_logs(keep).await?;
                println!("Pruned {removed} audit entries (kept newest {keep})");
            } else {
                let action = action
                    .as_deref()
                    .map(|a| a.parse::<citadel_vault::AuditAction>())
                    .transpose()?;
                let entries = vault
                    .audit_logs(AuditFilter {
                        secret_key: key.clone(),
                        action,
                        limit,
                        offset,
                    })
                    .await?;
                let total = vault.audit_count(key.as_deref()).await?;
                for entry in &entries {
                    println!(
                        "{}  {:<7} {:<32} {:<8} {}",
                        format_timestamp(entry.timestamp),
                        entry.action.to_string(),
                        entry.secret_key,
                        entry.environment,
                        entry.user
                    );
                }
                println!("{} of {} entries", entries.len(), total);
            }
        },
        Commands::Health => {
            let vault = Vault::open(&paths.db);
            let state = vault.state().await;
            println!("Vault:   {}", paths.db.display());
            println!("State:   {state}");
            let session = SessionCache::new(&paths.session);
            println!(
                "Session: {}",
                if session.has_valid_session() {
                    "active"
                } else {
                    "none"
                }
            );
            if state == VaultState::NotInitialized {
                std::process::exit(1);
            }
        },
        Commands::Backup {
            output,
            plain,
            list,
        } => {
            if list {
                let backups = list_backups(&paths.backups);
                if backups.is_empty() {
                    println!("No backups found in {}", paths.backups.display());
                } else {
                    for info in backups {
                        println!(
                            "{}  v{}  {}",
                            format_timestamp(info.metadata.created_at),
                            info.metadata.version,
                            info.path.display()
                        );
                    }
                }
                return Ok(());
            }

            let dest = output.unwrap_or_else(|| {
                let date = chrono::Local::now().format("%Y-%m-%d");
                paths.backups.join(format!("vault-backup-{date}.enc"))
            });
            let password = if plain {
                None
            } else {
                Some(prompt_new_password("Backup password: ")?)
            };
            let vault = Vault::open(&paths.db);
            vault.create_backup(&dest, password.as_deref()).await?;
            println!("Backup written to {}", dest.display());
        },
        Commands::Restore { input } => {
            let blob_head = std::fs::read(&input).context("failed to read backup file")?;
            let password = match blob_head.first() {
                Some(&0x01) => Some(prompt_password("Backup password: ")?),
                _ => None,
            };
            let vault = Vault::open(&paths.db);
            vault.restore_backup(&input, password.as_deref()).await?;
            SessionCache::new(&paths.session).delete_session()?;
            println!("Vault restored from {}; unlock to continue", input.display());
        },
        Commands::Export { output, env } => {
            let environment = env.as_deref().map(parse_env).transpose()?;
            let password = prompt_new_password("Export password: ")?;
            let vault = open_unlocked(&paths).await?;
            let blob = vault.export_secrets(&password, environment).await?;
            std::fs::write(&output, blob).context("failed to write export file")?;
            println!("Secrets exported to {}", output.display());
        },
        Commands::Import { input } => {
            let blob = std::fs::read(&input).context("failed to read import file")?;
            let password = prompt_password("Export password: ")?;
            let vault = open_unlocked(&paths).await?;
            let report = vault.import_secrets(&blob, &password).await?;
            println!("Imported {} new, {} updated", report.added, report.updated);
        },
    }

    Ok(())
}
