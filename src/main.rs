//! Ledgerline billing jobs
//!
//! Each subcommand is one short-lived, lockable job run meant to be
//! triggered by an external scheduler. Exit status is 0 on success and 1
//! on lock contention, job failure or a failure ratio over the threshold.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ledgerline_cache::{RedisCache, RedisLockStore, RedisNotificationQueue};
use ledgerline_core::{config::AppConfig, models::BillingPeriod, traits::Notifier};
use ledgerline_db::{
    create_pool, run_migrations, PgAccountRepository, PgCallRecordRepository, PgCdrSource,
    PgLedger, PgRateRepository, PgResourceRepository, PgSettingsStore,
};
use ledgerline_esl::FreeSwitchProvider;
use ledgerline_services::{
    BillingContext, CallMonitor, CdrOptions, CdrProcessor, FanoutNotifier, LedgerAuditor,
    MonitorOptions, RatingServiceImpl, RecurringBilling, RecurringOptions, TracingNotifier,
};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const AUDIT_LOCK_TTL: Duration = Duration::from_secs(1800);

#[derive(Parser, Debug)]
#[command(name = "ledgerline", version, about = "VoIP billing jobs")]
struct Cli {
    /// Configuration file (replaces config/default + config/{RUN_MODE})
    #[arg(long, global = true, env = "LEDGERLINE_CONFIG")]
    config: Option<String>,

    /// Log JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest final CDRs and settle call records
    ProcessCdrs(ProcessCdrsArgs),
    /// Meter connected calls and terminate over-budget ones
    MonitorCalls(MonitorCallsArgs),
    /// Charge monthly DID fees
    BillDids(BillDidsArgs),
    /// Recompute balances from the transaction log
    AuditLedger(AuditLedgerArgs),
}

#[derive(Args, Debug)]
struct ProcessCdrsArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_retries: Option<i32>,
    /// Wall-clock budget in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Trailing CDR window in minutes
    #[arg(long)]
    window: Option<i64>,
    #[arg(long)]
    dry_run: bool,
    /// Take the job lock even if held
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct MonitorCallsArgs {
    /// Hang up calls that qualify for termination
    #[arg(long)]
    terminate: bool,
    /// Duration ceiling in seconds
    #[arg(long)]
    max_duration: Option<i64>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct BillDidsArgs {
    /// Billing period, YYYY-MM (default: current month)
    #[arg(long)]
    month: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dry_run: bool,
    /// Re-run a period that was already processed
    #[arg(long)]
    force: bool,
    /// Take the job lock even if held
    #[arg(long)]
    force_lock: bool,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    suspend_insufficient: Option<bool>,
}

#[derive(Args, Debug)]
struct AuditLedgerArgs {
    #[arg(long)]
    force: bool,
}

/// Initialize tracing/logging
fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ledgerline={l},ledgerline_core={l},ledgerline_db={l},ledgerline_cache={l},\
             ledgerline_esl={l},ledgerline_services={l},sqlx=warn",
            l = level
        ))
    });

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

/// Wire the PostgreSQL, Redis and FreeSWITCH implementations together
async fn build_context(config: &AppConfig) -> anyhow::Result<BillingContext> {
    let pool = create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;
    if config.database.run_migrations {
        run_migrations(&pool).await.context("Failed to run migrations")?;
    }

    let cache = RedisCache::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    let cdrs = PgCdrSource::new(pool.clone(), config.freeswitch.cdr_table.clone())
        .context("Invalid CDR table")?;
    let telephony = FreeSwitchProvider::new(config.freeswitch.clone(), cdrs);

    let rating = RatingServiceImpl::new(
        Arc::new(PgRateRepository::new(pool.clone())),
        Arc::new(cache.clone()),
    )
    .with_ttl(config.redis.default_ttl_secs);

    let sinks: Vec<Arc<dyn Notifier>> = vec![
        Arc::new(TracingNotifier),
        Arc::new(RedisNotificationQueue::new(
            cache.connection(),
            config.redis.notification_queue.clone(),
            config.notifications.min_severity,
        )),
    ];

    Ok(BillingContext {
        accounts: Arc::new(PgAccountRepository::new(pool.clone())),
        ledger: Arc::new(PgLedger::new(pool.clone())),
        calls: Arc::new(PgCallRecordRepository::new(pool.clone())),
        rating: Arc::new(rating),
        resources: Arc::new(PgResourceRepository::new(pool.clone())),
        settings: Arc::new(PgSettingsStore::new(pool)),
        locks: Arc::new(RedisLockStore::new(cache.connection())),
        telephony: Arc::new(telephony),
        notifier: Arc::new(FanoutNotifier::new(sinks)),
    })
}

/// Run the selected job; `Ok(false)` means it ran but failed
async fn run(command: Command, config: AppConfig) -> anyhow::Result<bool> {
    let ctx = build_context(&config).await?;

    let outcome = match command {
        Command::ProcessCdrs(args) => {
            let mut options = CdrOptions::from(&config.cdr);
            if let Some(batch_size) = args.batch_size {
                options.batch_size = batch_size.max(1);
            }
            if let Some(max_retries) = args.max_retries {
                options.max_retries = max_retries;
            }
            if let Some(timeout) = args.timeout {
                options.timeout = Duration::from_secs(timeout);
            }
            if let Some(window) = args.window {
                options.window = chrono::Duration::minutes(window);
            }
            options.dry_run = args.dry_run;
            options.force = args.force;
            let threshold = options.failure_threshold_percent;

            CdrProcessor::new(ctx, options).run().await.map(|summary| {
                let over = summary.exceeds_failure_threshold(threshold);
                if over {
                    warn!(
                        failed = summary.failures(),
                        processed = summary.processed(),
                        "Failure ratio over {}%",
                        threshold
                    );
                }
                !over
            })
        }
        Command::MonitorCalls(args) => {
            let mut options = MonitorOptions::from(&config.monitor);
            options.terminate |= args.terminate;
            if let Some(max_duration) = args.max_duration {
                options.max_duration_secs = max_duration;
            }
            options.dry_run = args.dry_run;
            options.force = args.force;

            CallMonitor::new(ctx, options).run().await.map(|_| true)
        }
        Command::BillDids(args) => {
            let mut options = RecurringOptions::from(&config.recurring);
            if let Some(month) = args.month.as_deref() {
                options.period = BillingPeriod::parse(month)?;
            }
            if let Some(batch_size) = args.batch_size {
                options.batch_size = batch_size.max(1);
            }
            if let Some(suspend) = args.suspend_insufficient {
                options.suspend_insufficient = suspend;
            }
            options.dry_run = args.dry_run;
            options.force_period = args.force;
            options.force_lock = args.force_lock;

            RecurringBilling::new(ctx, options)
                .run()
                .await
                .map(|summary| summary.is_success())
        }
        Command::AuditLedger(args) => LedgerAuditor::new(ctx, AUDIT_LOCK_TTL, args.force)
            .run()
            .await
            .map(|summary| summary.is_consistent()),
    };

    match outcome {
        Ok(success) => Ok(success),
        Err(e) => {
            error!(code = e.error_code(), "Job failed: {}", e);
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        env::var("LOG_LEVEL").unwrap_or_else(|_| config.logging.level.clone())
    };
    init_tracing(&level, cli.json_logs || config.logging.json);

    info!("Ledgerline v{}", env!("CARGO_PKG_VERSION"));

    match run(cli.command, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
