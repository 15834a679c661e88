use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mana_ledger::{
    GameHost, LoginOutcome, ManaConfig, ManaEngine, ManaUnit, OwnerId, OwnerType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Command-line interface for a mana ledger
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON instead of tables
    #[clap(long, global = true)]
    json: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Resolve (or create) the owner id of a foreign entity
    Resolve {
        /// Foreign id of the entity
        foreign_id: i64,

        /// Entity kind (player, group, other)
        #[clap(long, short, default_value = "player")]
        kind: OwnerType,
    },

    /// List every known owner
    Owners,

    /// Add mana to an owner's pouch
    Grant {
        /// Owner id
        owner: u32,

        /// Amount of mana
        amount: u64,

        /// Identity credited as the unit's creator
        #[clap(long)]
        creator: Uuid,

        /// Gain time in epoch milliseconds; now when omitted
        #[clap(long)]
        at: Option<i64>,
    },

    /// Show the units held by an owner
    Pouch {
        /// Owner id
        owner: u32,
    },

    /// Remove the unit at one gain time
    Snipe {
        /// Owner id
        owner: u32,

        /// Gain time in epoch milliseconds
        at: i64,
    },

    /// Overwrite the content of the unit at one gain time
    Adjust {
        /// Owner id
        owner: u32,

        /// Gain time in epoch milliseconds
        at: i64,

        /// New content
        content: u64,
    },

    /// Move every unit gained at or before a cutoff to another owner
    TransferUntil {
        /// Sending owner id
        from: u32,

        /// Receiving owner id
        to: u32,

        /// Cutoff in epoch milliseconds (inclusive)
        cutoff: i64,
    },

    /// Delete every unit gained at or before a cutoff
    DeleteUntil {
        /// Owner id
        owner: u32,

        /// Cutoff in epoch milliseconds (inclusive)
        cutoff: i64,
    },

    /// Spend mana, oldest units first, and log the use
    Spend {
        /// Owner id
        owner: u32,

        /// Amount of mana
        amount: u64,

        /// Identity spending the mana
        #[clap(long)]
        user: Uuid,

        /// Target of the spend
        #[clap(long)]
        pearled: Uuid,

        /// Record the spend as an upgrade
        #[clap(long)]
        upgrade: bool,
    },

    /// Evaluate a player login and deliver the streak reward
    Login {
        /// Foreign id of the player
        foreign_id: i64,

        /// External identity of the player
        #[clap(long)]
        player: Uuid,

        /// Treat the player as pearled (ineligible for mana)
        #[clap(long)]
        pearled: bool,
    },

    /// Append a raw entry to the use log
    LogUse {
        /// Creator of the consumed mana
        #[clap(long)]
        creator: Uuid,

        /// Identity that used the mana
        #[clap(long)]
        user: Uuid,

        /// Target of the use
        #[clap(long)]
        pearled: Uuid,

        /// Amount of mana
        amount: u64,

        /// Record the use as an upgrade
        #[clap(long)]
        upgrade: bool,
    },

    /// Show the transfer log
    Transfers {
        /// Only transfers sent by this owner
        #[clap(long)]
        from: Option<u32>,

        /// Only transfers received by this owner
        #[clap(long)]
        to: Option<u32>,
    },

    /// Show the use log
    Uses,

    /// Show login streaks
    Streaks,

    /// Run one decay sweep
    Sweep,

    /// Run the decay worker until Ctrl-C
    Run,

    /// Print metrics in the Prometheus text format
    Metrics,
}

/// Host for logins issued from the terminal: messages go to stdout.
struct ConsoleHost {
    pearled: bool,
}

#[async_trait]
impl GameHost for ConsoleHost {
    async fn is_eligible_for_reward(&self, _player: Uuid) -> bool {
        !self.pearled
    }

    async fn notify(&self, player: Uuid, message: &str) {
        println!("{} {}", format!("[{}]", player).dimmed(), message);
    }
}

fn load_config(path: Option<&Path>) -> Result<ManaConfig> {
    match path {
        Some(path) => ManaConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from '{}'", path.display())),
        None => Ok(ManaConfig::default()),
    }
}

fn init_tracing(config: &ManaConfig) {
    let log_level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_time(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => ms.to_string(),
    }
}

fn print_unit(unit: &ManaUnit) {
    println!(
        "  {:>16}  {}  {:>8}  creator {}",
        unit.gain_time,
        format_time(unit.gain_time).dimmed(),
        unit.content.to_string().bold(),
        unit.creator_id,
    );
}

async fn show_pouch(engine: &ManaEngine, owner: OwnerId, json: bool) -> Result<()> {
    let pouch = engine.pouch(owner);
    let units = pouch.units().await?;
    if json {
        let rows: Vec<_> = units
            .iter()
            .map(|u| serde_json::json!({ "gain_time": u.gain_time, "content": u.content, "creator": u.creator_id.0 }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{} {}", "Pouch of owner".green().bold(), owner);
    for unit in &units {
        print_unit(unit);
    }
    println!("Live balance: {}", pouch.balance().await?.to_string().bold());
    Ok(())
}

async fn execute(engine: &ManaEngine, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Resolve { foreign_id, kind } => {
            let id = engine.registry().resolve(foreign_id, kind).await?;
            println!("{} {} {} -> owner {}", "Resolved".green(), kind, foreign_id, id.to_string().bold());
        }
        Commands::Owners => {
            let owners = engine.store().all_owners().await?;
            if json {
                let rows: Vec<_> = owners
                    .iter()
                    .map(|o| serde_json::json!({ "id": o.id.0, "foreign_id": o.foreign_id, "kind": o.foreign_type.to_string() }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{}", "Owners".green().bold());
                for o in owners {
                    println!("  {:>6}  {:<7} {}", o.id, o.foreign_type, o.foreign_id);
                }
            }
        }
        Commands::Grant { owner, amount, creator, at } => {
            let pouch = engine.pouch(OwnerId(owner));
            let unit = match at {
                Some(at) => pouch.add_unit(amount, at, creator).await?,
                None => pouch.grant(amount, creator).await?,
            };
            println!("{} {} mana to owner {}", "Granted".green(), amount, owner);
            print_unit(&unit);
        }
        Commands::Pouch { owner } => show_pouch(engine, OwnerId(owner), json).await?,
        Commands::Snipe { owner, at } => {
            if engine.pouch(OwnerId(owner)).remove_unit(at).await? {
                println!("{} unit {} of owner {}", "Removed".green(), at, owner);
            } else {
                println!("{}", "No unit at that time".yellow());
            }
        }
        Commands::Adjust { owner, at, content } => {
            if engine.pouch(OwnerId(owner)).set_unit_content(at, content).await? {
                println!("{} unit {} of owner {} to {}", "Set".green(), at, owner, content);
            } else {
                println!("{}", "No unit at that time".yellow());
            }
        }
        Commands::TransferUntil { from, to, cutoff } => {
            let outcome = engine.transfer_until(OwnerId(from), OwnerId(to), cutoff).await?;
            println!(
                "{} {} units ({} mana) from owner {} to owner {}",
                "Moved".green(),
                outcome.units,
                outcome.amount,
                from,
                to
            );
        }
        Commands::DeleteUntil { owner, cutoff } => {
            let removed = engine.pouch(OwnerId(owner)).delete_until(cutoff).await?;
            println!("{} {} units of owner {}", "Deleted".green(), removed, owner);
        }
        Commands::Spend { owner, amount, user, pearled, upgrade } => {
            let rows = engine.use_mana(OwnerId(owner), amount, user, pearled, upgrade).await?;
            println!("{} {} mana from owner {}", "Spent".green(), amount, owner);
            for row in rows {
                println!("  creator {:>6}  {:>8}", row.creator, row.amount);
            }
        }
        Commands::Login { foreign_id, player, pearled } => {
            let rewarder = engine.login_rewarder(Arc::new(ConsoleHost { pearled }));
            match rewarder.on_login(player, foreign_id).await? {
                LoginOutcome::NoReward => println!("{}", "Already rewarded today".yellow()),
                LoginOutcome::Delivered { reward, .. } => println!(
                    "{} {} mana (streak {})",
                    "Delivered".green(),
                    reward.amount,
                    reward.streak
                ),
                LoginOutcome::Withheld { reward } => println!(
                    "{} reward of {} (streak {})",
                    "Withheld".red(),
                    reward.amount,
                    reward.streak
                ),
            }
        }
        Commands::LogUse { creator, user, pearled, amount, upgrade } => {
            let entry = engine.uses().log_use(creator, user, pearled, amount, upgrade).await?;
            println!("{} use of {} at {}", "Logged".green(), entry.amount, format_time(entry.log_time));
        }
        Commands::Transfers { from, to } => {
            let rows = engine.transfers().entries(from.map(OwnerId), to.map(OwnerId)).await?;
            if json {
                let rows: Vec<_> = rows
                    .iter()
                    .map(|e| serde_json::json!({ "log_time": e.log_time, "from": e.from_owner.0, "to": e.to_owner.0, "amount": e.amount }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{}", "Transfers".green().bold());
                for e in rows {
                    println!("  {}  {:>6} -> {:<6} {:>8}", format_time(e.log_time), e.from_owner, e.to_owner, e.amount);
                }
            }
        }
        Commands::Uses => {
            println!("{}", "Uses".green().bold());
            for e in engine.uses().entries().await? {
                println!(
                    "  {}  creator {:>6}  user {:>6}  target {:>6}  {:>8}{}",
                    format_time(e.log_time),
                    e.creator,
                    e.user,
                    e.pearled_target,
                    e.amount,
                    if e.is_upgrade { " (upgrade)" } else { "" }
                );
            }
        }
        Commands::Streaks => {
            println!("{}", "Login streaks".green().bold());
            for stat in engine.streaks().all_stats().await? {
                println!("  owner {:>6}  streak {:>4}  last day {}", stat.owner_id, stat.streak, stat.last_day);
            }
        }
        Commands::Sweep => {
            let removed = engine.decay_sweep().await?;
            println!("{} {} decayed units", "Removed".green(), removed);
        }
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let worker = tokio::spawn(engine.decay_worker().run(shutdown_rx));
            info!("decay worker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            info!("shutting down");
            shutdown_tx
                .send(true)
                .map_err(|_| anyhow!("decay worker exited early"))?;
            worker.await?;
        }
        Commands::Metrics => print!("{}", mana_ledger::metrics::gather_text()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    let engine = ManaEngine::open(config)
        .await
        .context("Failed to open the mana ledger")?;
    let result = execute(&engine, cli.command, cli.json).await;
    engine.store().flush().await?;
    result
}
