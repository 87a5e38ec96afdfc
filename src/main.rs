//! joint-settle - run and inspect joint account settlements
//!
//! Usage:
//!   joint-settle settle --account 3 --period 2026-10
//!   joint-settle settle --account 3 --period 2026-10 --caller 7
//!   joint-settle history --account 3
//!   joint-settle account --account 3
//!   joint-settle create --name household --creator 1 --keep-positive --share 1=6000 --share 2=4000
//!   joint-settle contribute --account 3 --member 2 --amount 12500
//!   joint-settle adjust --account 3 --amount -4000

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use joint_settlement::config::Config;
use joint_settlement::settlement::{
    AccountSource, BasisPoints, MemberId, Share, SettlementDb, SettlementEngine, SettlementError,
    SettlementPeriod, ShareSet,
};

#[derive(Parser, Debug)]
#[command(name = "joint-settle")]
#[command(about = "Reconcile shared accounts and inspect settlement history")]
struct Cli {
    /// Path to the SQLite database (defaults to SETTLEMENT_DB_PATH)
    #[arg(short, long, env = "SETTLEMENT_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Settle one account for one period
    Settle {
        #[arg(short, long)]
        account: i64,

        /// Period key, e.g. 2026-10
        #[arg(short, long)]
        period: String,

        /// Authenticated member requesting the settlement
        #[arg(short, long)]
        caller: Option<i64>,
    },

    /// Print every settlement run for an account
    History {
        #[arg(short, long)]
        account: i64,
    },

    /// Print an account with its shares
    Account {
        #[arg(short, long)]
        account: i64,
    },

    /// Create a joint account with its share configuration
    Create {
        #[arg(short, long)]
        name: String,

        /// Member creating the account
        #[arg(short, long)]
        creator: i64,

        /// Refuse settlements that would overdraw the account
        #[arg(short, long)]
        keep_positive: bool,

        /// Share as MEMBER=BASIS_POINTS, repeated once per member
        #[arg(short, long = "share", value_parser = parse_share)]
        shares: Vec<Share>,
    },

    /// Record a member contribution (negative amounts are withdrawals)
    Contribute {
        #[arg(short, long)]
        account: i64,

        #[arg(short, long)]
        member: i64,

        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
    },

    /// Move the balance without attributing it to a member
    Adjust {
        #[arg(short, long)]
        account: i64,

        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
    },
}

fn parse_share(raw: &str) -> Result<Share, String> {
    let (member, bp) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MEMBER=BASIS_POINTS, got '{}'", raw))?;
    let member_id: MemberId = member
        .trim()
        .parse()
        .map_err(|e| format!("bad member id '{}': {}", member, e))?;
    let basis_points: BasisPoints = bp
        .trim()
        .parse()
        .map_err(|e| format!("bad basis points '{}': {}", bp, e))?;
    Ok(Share::new(member_id, basis_points))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let cli = Cli::parse();
    let db_path = cli.db_path.unwrap_or(config.database_path);
    let db = Arc::new(SettlementDb::new(&db_path).with_context(|| format!("open {}", db_path))?);
    let engine = SettlementEngine::new(db.clone(), db.clone(), db.clone());

    match cli.command {
        Commands::Settle {
            account,
            period,
            caller,
        } => {
            let period = SettlementPeriod::new(&period).ok_or_else(|| anyhow!("period required"))?;
            let result = match caller {
                Some(member) => engine.settle_as(member, account, &period).await,
                None => engine.settle(account, &period).await,
            };
            match result {
                Ok(run) => {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
                Err(SettlementError::AlreadySettled { run }) => {
                    info!(
                        account_id = account,
                        period = %period,
                        sequence = run.sequence,
                        "Already settled, nothing to do"
                    );
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
                Err(err) => {
                    if let Some(run) = err.run() {
                        println!("{}", serde_json::to_string_pretty(run)?);
                    }
                    if err.is_retryable() {
                        warn!(account_id = account, "Settlement can be retried after corrective action");
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::History { account } => {
            let history = engine.settlement_history(account).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Account { account } => {
            let acct = db
                .get_joint_account(account)
                .await?
                .ok_or_else(|| anyhow!("joint account {} not found", account))?;
            println!("{}", serde_json::to_string_pretty(&acct)?);
        }
        Commands::Create {
            name,
            creator,
            keep_positive,
            shares,
        } => {
            let share_set = ShareSet::validate(&shares)?;
            let account_id = db
                .create_account_with_shares(&name, creator, keep_positive, share_set.shares())
                .await?;
            info!(account_id, members = share_set.len(), "Joint account created");
            println!("{}", account_id);
        }
        Commands::Contribute {
            account,
            member,
            amount,
        } => {
            let contribution = db
                .post_contribution(account, member, amount, chrono::Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&contribution)?);
        }
        Commands::Adjust { account, amount } => {
            db.adjust_balance(account, amount).await?;
            info!(account_id = account, amount_cents = amount, "Balance adjusted");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| "joint_settlement=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
