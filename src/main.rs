//! QuestLedger command-line entry point.
//!
//! Usage:
//!   questledger init                      Create the home directory and database
//!   questledger award --user U --amount N Award experience
//!   questledger profile --user U          Show xp, level and badges
//!   questledger run-recurring --user U    Apply due recurring transactions
//!   questledger run-savings --user U      Apply due savings contributions

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use questledger::clock::{Clock, IdGenerator, SystemClock, UlidIds};
use questledger::config::{self, LedgerConfig};
use questledger::error::LedgerError;
use questledger::gamification::{AwardOutcome, AwardRequest, XpCoordinator};
use questledger::scheduler::{NewRecurringRule, NewSavingsPlan, RecurringScheduler};
use questledger::state::LedgerStore;
use questledger::types::*;

const CONFIG_FILE: &str = "ledger.toml";

/// Experience granted for recording a transaction.
const TRANSACTION_XP: i64 = 10;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "questledger")]
#[command(version = "0.1.0")]
#[command(about = "Gamified personal-finance ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the questledger home directory.
    #[arg(long, default_value = "~/.questledger")]
    home: String,

    /// Log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the home directory, config and database.
    Init,

    /// Award (or deduct) experience.
    Award {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "manual_award")]
        reason: String,
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
    },

    /// Show a user's profile.
    Profile {
        #[arg(long)]
        user: String,
    },

    /// Compare profile xp with the experience log.
    Audit {
        #[arg(long)]
        user: String,
    },

    /// Show the experience log.
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Record a transaction and award experience for it.
    AddTx {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: f64,
        #[arg(long = "type", default_value = "expense")]
        kind: TxType,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },

    /// Create a savings goal.
    AddGoal {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        target: f64,
    },

    /// Register a recurring transaction.
    AddRule {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "type")]
        kind: Option<TxType>,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        cadence: Option<String>,
    },

    /// Register a savings plan for a goal.
    AddPlan {
        #[arg(long)]
        user: String,
        #[arg(long)]
        goal: String,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        interval: Option<String>,
    },

    /// Apply recurring rules: one rule now, or every due rule.
    RunRecurring {
        #[arg(long)]
        user: String,
        #[arg(long)]
        rule: Option<String>,
    },

    /// Apply savings plans: one plan now, or every due plan.
    RunSavings {
        #[arg(long)]
        user: String,
        #[arg(long)]
        plan: Option<String>,
    },
}

/// Everything a command needs, opened once per process.
struct Runtime {
    config: LedgerConfig,
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Runtime {
    fn coordinator(&self) -> XpCoordinator {
        XpCoordinator::new(self.store.clone(), self.clock.clone(), self.ids.clone())
    }

    fn scheduler(&self) -> RecurringScheduler {
        RecurringScheduler::new(self.store.clone(), self.ids.clone())
            .with_default_currency(&self.config.default_currency)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve home directory
    let home_dir = PathBuf::from(shellexpand::tilde(&cli.home).into_owned());

    // Initialize logging; the flag wins over the config file
    let level = match &cli.log_level {
        Some(level) => level.clone(),
        None => config::load_config(&home_dir.join(CONFIG_FILE))
            .map(|c| c.log_level)
            .unwrap_or_else(|_| "info".into()),
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Commands::Init = cli.command {
        return cmd_init(&home_dir);
    }

    let rt = bootstrap(&home_dir)?;
    match cli.command {
        Commands::Init => Ok(()),
        Commands::Award {
            user,
            reason,
            amount,
            entity_type,
            entity_id,
        } => cmd_award(&rt, user, reason, amount, entity_type, entity_id).await,
        Commands::Profile { user } => cmd_profile(&rt, &user).await,
        Commands::Audit { user } => cmd_audit(&rt, &user).await,
        Commands::History { user, limit } => cmd_history(&rt, &user, limit).await,
        Commands::AddTx {
            user,
            amount,
            kind,
            currency,
            category,
            description,
        } => cmd_add_tx(&rt, user, amount, kind, currency, category, description).await,
        Commands::AddGoal { user, name, target } => cmd_add_goal(&rt, user, name, target).await,
        Commands::AddRule {
            user,
            amount,
            name,
            kind,
            currency,
            category,
            description,
            cadence,
        } => {
            let input = NewRecurringRule {
                user_id: user,
                name,
                amount,
                currency,
                category,
                description,
                tx_type: kind,
                cadence: cadence.as_deref().map(Cadence::from),
            };
            cmd_add_rule(&rt, input).await
        }
        Commands::AddPlan {
            user,
            goal,
            amount,
            interval,
        } => {
            let input = NewSavingsPlan {
                user_id: user,
                goal_id: goal,
                amount_per_interval: amount,
                interval: interval.as_deref().map(Cadence::from),
            };
            cmd_add_plan(&rt, input).await
        }
        Commands::RunRecurring { user, rule } => cmd_run_recurring(&rt, &user, rule).await,
        Commands::RunSavings { user, plan } => cmd_run_savings(&rt, &user, plan).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn cmd_init(home_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(home_dir)
        .with_context(|| format!("Failed to create home directory: {}", home_dir.display()))?;

    let config_path = home_dir.join(CONFIG_FILE);
    let cfg = if config_path.exists() {
        config::load_config(&config_path)?
    } else {
        let cfg = LedgerConfig {
            db_path: home_dir.join("ledger.db").to_string_lossy().into_owned(),
            ..LedgerConfig::default()
        };
        config::save_config(&cfg, &config_path)?;
        cfg
    };

    let store = LedgerStore::from_config(&cfg)?;
    println!(
        "{} Ledger ready at {} ({} mode)",
        ">>>".green().bold(),
        cfg.resolved_db_path(),
        store.mode()
    );
    Ok(())
}

async fn cmd_award(
    rt: &Runtime,
    user: String,
    reason: String,
    amount: i64,
    entity_type: Option<String>,
    entity_id: Option<String>,
) -> Result<()> {
    if amount == 0 {
        bail!("amount must be non-zero");
    }

    let mut request = AwardRequest::new(user, reason, amount);
    request.related_entity_type = entity_type;
    request.related_entity_id = entity_id;

    let outcome = rt.coordinator().award(request).await?;
    print_award(&outcome);
    Ok(())
}

async fn cmd_profile(rt: &Runtime, user: &str) -> Result<()> {
    let profile = match rt.coordinator().profile(user).await {
        Ok(profile) => profile,
        Err(LedgerError::NotFound(_)) => {
            println!("{} No profile for {}", "!".yellow().bold(), user);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!();
    println!("{}", format!("=== {} ===", profile.user_id).bold());
    println!();
    println!("  {}:    {}", "Level".bold(), profile.level.to_string().green());
    println!("  {}:       {}", "XP".bold(), profile.xp);
    println!("  {}:", "Badges".bold());
    if profile.badges.is_empty() {
        println!("    {}", "none yet".dimmed());
    }
    for badge in &profile.badges {
        println!(
            "    {}  {}",
            badge.code.cyan(),
            badge.awarded_at.format("%Y-%m-%d").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

async fn cmd_audit(rt: &Runtime, user: &str) -> Result<()> {
    let audit = rt.coordinator().audit(user).await?;
    let status = if audit.is_consistent() {
        "consistent".green()
    } else {
        "DRIFT".red().bold()
    };
    println!(
        "{}: profile xp {}, logged xp {} over {} entries ({})",
        audit.user_id, audit.profile_xp, audit.logged_xp, audit.entries, status
    );
    if !audit.is_consistent() {
        println!("  drift: {}", audit.drift());
    }
    Ok(())
}

async fn cmd_history(rt: &Runtime, user: &str, limit: usize) -> Result<()> {
    let entries = rt.coordinator().history(user, limit).await?;
    if entries.is_empty() {
        println!("{}", "No experience logged".dimmed());
    }
    for entry in entries {
        let delta = if entry.xp_delta >= 0 {
            format!("+{}", entry.xp_delta).green()
        } else {
            entry.xp_delta.to_string().red()
        };
        println!(
            "{}  {:>6}  {}",
            entry.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            delta,
            entry.reason
        );
    }
    Ok(())
}

async fn cmd_add_tx(
    rt: &Runtime,
    user: String,
    amount: f64,
    kind: TxType,
    currency: Option<String>,
    category: Option<String>,
    description: Option<String>,
) -> Result<()> {
    if user.trim().is_empty() || !(amount.is_finite() && amount > 0.0) {
        bail!("user and a positive amount are required");
    }

    let now = rt.clock.now();
    let transaction = Transaction {
        id: rt.ids.next_id(),
        user_id: user.trim().to_string(),
        tx_type: kind,
        amount,
        currency: currency
            .map(|c| c.trim().to_uppercase())
            .unwrap_or_else(|| rt.config.default_currency.clone()),
        category,
        description,
        occurred_at: now,
        created_at: now,
        updated_at: now,
        is_deleted: false,
    };
    let stored = transaction.clone();
    rt.store
        .write(move |ledger| ledger.insert_transaction(&stored))
        .await?;
    println!(
        "{} Recorded {} {:.2} {} ({})",
        ">>>".green().bold(),
        transaction.tx_type,
        transaction.amount,
        transaction.currency,
        transaction.id
    );

    // The transaction stands even if the award fails
    let request = AwardRequest::new(&transaction.user_id, "add_transaction", TRANSACTION_XP)
        .related_to("transaction", &transaction.id);
    match rt.coordinator().award(request).await {
        Ok(outcome) => print_award(&outcome),
        Err(e) => warn!("XP award for transaction {} failed: {e}", transaction.id),
    }
    Ok(())
}

async fn cmd_add_goal(rt: &Runtime, user: String, name: String, target: f64) -> Result<()> {
    if user.trim().is_empty() || !(target.is_finite() && target > 0.0) {
        bail!("user and a positive target are required");
    }

    let now = rt.clock.now();
    let goal = Goal {
        id: rt.ids.next_id(),
        user_id: user.trim().to_string(),
        name,
        target_amount: target,
        current_amount: 0.0,
        deadline: None,
        status: GoalStatus::Active,
        created_at: now,
        updated_at: now,
        is_deleted: false,
    };
    let stored = goal.clone();
    rt.store.write(move |ledger| ledger.insert_goal(&stored)).await?;
    println!(
        "{} Goal '{}' created ({}), target {:.2}",
        ">>>".green().bold(),
        goal.name,
        goal.id,
        goal.target_amount
    );
    Ok(())
}

async fn cmd_add_rule(rt: &Runtime, input: NewRecurringRule) -> Result<()> {
    let rule = rt.scheduler().register_rule(input, rt.clock.now()).await?;
    println!(
        "{} Rule '{}' ({}): {} {:.2} {} every {}",
        ">>>".green().bold(),
        rule.name,
        rule.id,
        rule.tx_type,
        rule.amount,
        rule.currency,
        rule.cadence
    );
    Ok(())
}

async fn cmd_add_plan(rt: &Runtime, input: NewSavingsPlan) -> Result<()> {
    let plan = rt.scheduler().register_plan(input, rt.clock.now()).await?;
    println!(
        "{} Plan {}: {:.2} to goal {} every {}",
        ">>>".green().bold(),
        plan.id,
        plan.amount_per_interval,
        plan.goal_id,
        plan.interval
    );
    Ok(())
}

async fn cmd_run_recurring(rt: &Runtime, user: &str, rule: Option<String>) -> Result<()> {
    let scheduler = rt.scheduler();
    let now = rt.clock.now();

    if let Some(rule_id) = rule {
        let run = scheduler.run_recurring_now(&rule_id, user, now).await?;
        println!(
            "{} Transaction {} created, next run {}",
            ">>>".green().bold(),
            run.transaction.id,
            run.next_run.to_rfc3339()
        );
        return Ok(());
    }

    let batch = scheduler.run_recurring_due(user, now).await?;
    println!("Processed {} recurring rule(s)", batch.processed.to_string().green());
    for tx in &batch.transactions {
        println!("  {} {} {:.2} {}", tx.id.dimmed(), tx.tx_type, tx.amount, tx.currency);
    }
    print_failures(&batch.failed);
    Ok(())
}

async fn cmd_run_savings(rt: &Runtime, user: &str, plan: Option<String>) -> Result<()> {
    let scheduler = rt.scheduler();
    let now = rt.clock.now();

    if let Some(plan_id) = plan {
        let contribution = scheduler.run_savings_now(&plan_id, user, now).await?;
        println!(
            "{} Added {:.2} to goal {}, next run {}",
            ">>>".green().bold(),
            contribution.amount,
            contribution.goal_id,
            contribution.next_run.to_rfc3339()
        );
        return Ok(());
    }

    let batch = scheduler.run_savings_due(user, now).await?;
    println!("Processed {} savings plan(s)", batch.processed.to_string().green());
    for c in &batch.contributions {
        println!("  {:.2} -> goal {}", c.amount, c.goal_id);
    }
    print_failures(&batch.failed);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load config and open the store.
fn bootstrap(home_dir: &Path) -> Result<Runtime> {
    let config_path = home_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        eprintln!(
            "{} No config found at {:?}. Run `questledger init` first.",
            "Error:".red().bold(),
            config_path
        );
        std::process::exit(1);
    }

    let cfg = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let store = LedgerStore::from_config(&cfg)?;
    info!("Opened ledger at {} ({} mode)", cfg.resolved_db_path(), store.mode());

    Ok(Runtime {
        config: cfg,
        store,
        clock: Arc::new(SystemClock),
        ids: Arc::new(UlidIds),
    })
}

fn print_award(outcome: &AwardOutcome) {
    println!(
        "{} {} xp -> total {}, level {} ({})",
        ">>>".green().bold(),
        outcome.xp_awarded,
        outcome.total_xp,
        outcome.new_level.to_string().bold(),
        outcome.mode.to_string().dimmed()
    );
    for badge in &outcome.new_badges {
        println!("    {} {}", "badge".yellow().bold(), badge.code.cyan());
    }
    if let Some(e) = &outcome.badge_error {
        println!("    {} badge evaluation failed: {}", "!".yellow().bold(), e);
    }
}

fn print_failures(failed: &[questledger::scheduler::ItemFailure]) {
    for failure in failed {
        println!(
            "  {} {}: {}",
            "failed".red().bold(),
            failure.id,
            failure.error
        );
    }
}
