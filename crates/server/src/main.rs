//! Drop Scout: rapid-drop detection, backtesting and analysis
//!
//! Usage:
//!   drop-scout download --from 2024-03-01 --to 2024-03-07   Fill the kline cache
//!   drop-scout backtest --from 2024-03-01 --to 2024-03-07   Download + per-day backtest
//!   drop-scout analyze --fee 0.2                            Rank stored configs by expectancy
//!   drop-scout monitor --symbol BTCUSDT                     Live detection over WebSocket

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use engine::analysis::DEFAULT_FEE_PERCENT;
use engine::config::{parse_date_range, resolve_symbols};
use engine::monitor::DEFAULT_WS_URL;
use engine::outcome::{closest_after_point, drawdown_after_trigger, percent_change, RECOVERY_INTERVALS};
use engine::{
    analyze_runs, filter_new_configs, persist_report, run_from_cache, run_monitor,
    trailing_seconds, BacktestReport, BinanceClient, ConfigAnalysis, DetectorConfig,
    Downloader, DropEvent, KlineCache, PatternConfigFile, PatternKind, ReconnectPolicy,
    RunSummary, TimeRange,
};
use persistence::repository::BacktestRepository;
use persistence::Database;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "drop-scout")]
#[command(about = "Rapid price drop detector and backtester for Binance spot pairs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download missing 1s klines into the local cache
    Download {
        /// First day (YYYY-MM-DD, UTC)
        #[arg(long)]
        from: String,
        /// Last day, inclusive (YYYY-MM-DD, UTC)
        #[arg(long)]
        to: String,
        /// Single symbol (default: BTCUSDT, ETHUSDT, SOLUSDT)
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Download, then backtest every configured detector day by day
    Backtest {
        /// First day; overrides the config file
        #[arg(long)]
        from: Option<String>,
        /// Last day, inclusive; overrides the config file
        #[arg(long)]
        to: Option<String>,
        /// Single symbol (default: BTCUSDT, ETHUSDT, SOLUSDT)
        #[arg(long)]
        symbol: Option<String>,
        /// Config file (default: configs/<pattern>.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pattern to backtest
        #[arg(long, default_value = "rapid-drop")]
        pattern: String,
        /// Do not write results to the database
        #[arg(long)]
        no_persist: bool,
        /// Only download data, skip the analysis
        #[arg(long)]
        dry_run: bool,
    },
    /// Combine stored runs per config and rank them by expectancy
    Analyze {
        /// Only runs of this symbol
        #[arg(long)]
        symbol: Option<String>,
        /// Fee per side in percent
        #[arg(long, default_value_t = DEFAULT_FEE_PERCENT)]
        fee: Decimal,
        /// Only runs recorded with this record-after length (seconds)
        #[arg(long)]
        record_after: Option<i64>,
    },
    /// Watch the live 1s kline stream and record drop events
    Monitor {
        /// Single symbol (default: BTCUSDT, ETHUSDT, SOLUSDT)
        #[arg(long)]
        symbol: Option<String>,
        /// Config file (default: configs/<pattern>.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pattern to detect
        #[arg(long, default_value = "rapid-drop")]
        pattern: String,
        /// Do not write events to the database
        #[arg(long)]
        no_persist: bool,
    },
}

/// Paths and endpoints from the environment
struct Settings {
    db_path: String,
    cache_dir: PathBuf,
    binance_url: String,
    ws_url: String,
}

impl Settings {
    fn from_env() -> Self {
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
        Self {
            db_path: var("DROP_SCOUT_DB_PATH", "data/drop_scout.db"),
            cache_dir: PathBuf::from(var("DROP_SCOUT_CACHE_DIR", "data/klines")),
            binance_url: var("DROP_SCOUT_BINANCE_URL", engine::api::binance::DEFAULT_BASE_URL),
            ws_url: var("DROP_SCOUT_WS_URL", DEFAULT_WS_URL),
        }
    }

    async fn open_db(&self) -> anyhow::Result<Database> {
        let db = Database::new(&self.db_path)
            .await
            .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
        info!("Database opened: {}", self.db_path);
        Ok(db)
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug,engine=debug,drop_scout=debug,sqlx=warn")
        } else {
            EnvFilter::new("info,engine=info,drop_scout=info,sqlx=warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();

    let result = match cli.command {
        Commands::Download { from, to, symbol } => {
            cmd_download(&settings, &from, &to, symbol.as_deref()).await
        }
        Commands::Backtest {
            from,
            to,
            symbol,
            config,
            pattern,
            no_persist,
            dry_run,
        } => {
            cmd_backtest(
                &settings,
                BacktestArgs {
                    from,
                    to,
                    symbol,
                    config,
                    pattern,
                    no_persist,
                    dry_run,
                },
            )
            .await
        }
        Commands::Analyze {
            symbol,
            fee,
            record_after,
        } => cmd_analyze(&settings, symbol.as_deref(), fee, record_after).await,
        Commands::Monitor {
            symbol,
            config,
            pattern,
            no_persist,
        } => cmd_monitor(&settings, symbol.as_deref(), config, &pattern, no_persist).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

/// Resolve the pattern name and load its config file
fn load_pattern_config(
    pattern: &str,
    config: Option<PathBuf>,
) -> anyhow::Result<(PatternKind, PathBuf, PatternConfigFile)> {
    let pattern = PatternKind::from_str(pattern)?;
    let path = config.unwrap_or_else(|| pattern.default_config_path());
    let file = PatternConfigFile::load(&path)?;
    Ok((pattern, path, file))
}

async fn cmd_download(
    settings: &Settings,
    from: &str,
    to: &str,
    symbol: Option<&str>,
) -> anyhow::Result<()> {
    let (from, to) = parse_date_range(from, to)?;
    let symbols = resolve_symbols(symbol);
    let started = Instant::now();

    println!("Download: {} from {} to {}\n", symbols.join(", "), from, to);

    let client = BinanceClient::with_base_url(&settings.binance_url)?;
    let cache = KlineCache::new(&settings.cache_dir);
    let downloader = Downloader::new(&client, &cache);
    let range = TimeRange::for_days(from, to);

    for symbol in &symbols {
        println!("Downloading {symbol}...");
        let summary = downloader.download_symbol(symbol, range).await?;
        report_download(&summary);
    }

    println!("\nDownload complete in {:.1}s.", started.elapsed().as_secs_f64());
    Ok(())
}

fn report_download(summary: &engine::DownloadSummary) {
    if summary.missing == 0 {
        println!("  Cache complete, no downloads needed");
        return;
    }
    for (day, count) in &summary.cached {
        println!("    {day}: {count} klines cached");
    }
    for (day, count) in &summary.incomplete {
        println!("    {day}: only {count} klines, left uncached");
    }
}

struct BacktestArgs {
    from: Option<String>,
    to: Option<String>,
    symbol: Option<String>,
    config: Option<PathBuf>,
    pattern: String,
    no_persist: bool,
    dry_run: bool,
}

async fn cmd_backtest(settings: &Settings, args: BacktestArgs) -> anyhow::Result<()> {
    let started = Instant::now();

    // Everything that can be wrong with the input fails before any I/O
    let (pattern, config_path, file) = load_pattern_config(&args.pattern, args.config)?;
    let (from, to) = file.resolve_range(args.from.as_deref(), args.to.as_deref())?;
    let configs = file.configs;
    let symbols = resolve_symbols(args.symbol.as_deref());
    let range = TimeRange::for_days(from, to);
    let days = range.days();
    let trailing = trailing_seconds(&configs);

    let flags: Vec<&str> = [(args.dry_run, "dry-run"), (args.no_persist, "no-persist")]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
    println!("Config: {} ({} config(s))", config_path.display(), configs.len());
    println!(
        "Backtest [{}]: {} | {} day(s) from {} to {}{}\n",
        pattern,
        symbols.join(", "),
        days.len(),
        from,
        to,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        }
    );

    // Phase 1: download the full range plus trailing data for every symbol
    let client = BinanceClient::with_base_url(&settings.binance_url)?;
    let cache = KlineCache::new(&settings.cache_dir);
    let downloader = Downloader::new(&client, &cache);
    for symbol in &symbols {
        println!("Downloading {symbol}...");
        let summary = downloader
            .download_symbol(symbol, range.extended_by(trailing))
            .await?;
        report_download(&summary);
    }

    if args.dry_run {
        println!(
            "\nDry-run complete in {:.1}s. Data cached, no analysis performed.",
            started.elapsed().as_secs_f64()
        );
        return Ok(());
    }

    // Phase 2: one run per (symbol, day)
    let db = if args.no_persist {
        None
    } else {
        Some(settings.open_db().await?)
    };

    let mut days_with_data = 0;
    for symbol in &symbols {
        for day in &days {
            let day_range = TimeRange::for_day(*day);
            println!("\nAnalyzing {symbol} {day} [{pattern}]...");

            let pending = match &db {
                Some(db) => match filter_new_configs(db, symbol, day_range, &configs).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        warn!(symbol = %symbol, %day, error = %e, "Could not check stored runs, running all configs");
                        configs.clone()
                    }
                },
                None => configs.clone(),
            };
            if pending.is_empty() {
                println!("  All configs already stored, skipped");
                continue;
            }

            let report = run_from_cache(&cache, symbol, &pending, day_range)?;
            if report.is_empty() {
                println!("  No cached data for {symbol} {day}");
                continue;
            }
            days_with_data += 1;
            print_report(&report);

            if let Some(db) = &db {
                let saved = persist_report(db, &report).await;
                if saved.failed > 0 {
                    warn!(symbol = %symbol, %day, failed = saved.failed, "Some runs were not persisted");
                }
            }
        }
    }

    if days_with_data == 0 {
        println!("\nNo data: no cached klines for the requested range.");
    }
    println!("\nBacktest complete in {:.1}s.", started.elapsed().as_secs_f64());
    Ok(())
}

fn format_time(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn signed(value: Decimal, dp: u32) -> String {
    let value = value.round_dp(dp);
    let prec = dp as usize;
    if value.is_sign_negative() {
        format!("{:.prec$}", value)
    } else {
        format!("+{:.prec$}", value)
    }
}

fn print_event_summary(event: &DropEvent, index: usize) {
    println!(
        "  Event {}: drop -{:.1}% at {} ({} UTC)",
        index + 1,
        event.drop_percent,
        event.trigger_price,
        format_time(event.trigger_timestamp)
    );

    let drawdown = drawdown_after_trigger(event).unwrap_or_default();
    let delay = (event.lowest_price_timestamp - event.trigger_timestamp) / 1000;
    println!(
        "    Further drawdown after entry: -{:.2}% (low {} after {}s)",
        drawdown, event.lowest_price, delay
    );

    let recovery: Vec<String> = RECOVERY_INTERVALS
        .iter()
        .filter_map(|&seconds| {
            let point = closest_after_point(event, seconds)?;
            let change = percent_change(event.trigger_price, point.price)?;
            Some(format!("{}% after {}min", signed(change, 2), seconds / 60))
        })
        .collect();
    if !recovery.is_empty() {
        println!("    Recovery: {}", recovery.join(", "));
    }
}

fn print_report(report: &BacktestReport) {
    for result in &report.results {
        if result.events.is_empty() {
            continue;
        }
        println!(
            "\n  Config {} ({} events):",
            result.config.label(),
            result.events.len()
        );
        for (i, event) in result.events.iter().enumerate() {
            print_event_summary(event, i);
        }
    }
}

async fn cmd_analyze(
    settings: &Settings,
    symbol: Option<&str>,
    fee: Decimal,
    record_after: Option<i64>,
) -> anyhow::Result<()> {
    let db = settings.open_db().await?;
    let symbol = symbol.map(|s| s.to_uppercase());

    let rows = BacktestRepository::new(db.pool())
        .list_runs(symbol.as_deref(), record_after)
        .await
        .map_err(|e| anyhow::anyhow!("Loading runs failed: {}", e))?;

    if rows.is_empty() {
        println!("No data found. Run the backtester first.");
        return Ok(());
    }

    let runs = rows
        .iter()
        .map(RunSummary::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let analyses = analyze_runs(&runs, fee);

    println!(
        "\nAnalysis: {} | Fee: {}% per side | {} run(s)\n",
        symbol.as_deref().unwrap_or("ALL"),
        fee,
        rows.len()
    );

    if analyses.is_empty() {
        println!("No events found in the stored runs.");
        return Ok(());
    }

    print_analysis(&analyses);
    println!(
        "\nExpectancy = WinRate * (AvgMaxProfit - {}% fee) - LossRate * AvgMaxDrawdown",
        (fee * Decimal::TWO).normalize()
    );
    Ok(())
}

fn print_analysis(analyses: &[ConfigAnalysis]) {
    println!(
        "  {:<22} {:>5} {:>7} {:>8} {:>9} {:>9} {:>8} {:>8} {:>7} {:>8} {:>8}",
        "Config", "Runs", "Events", "WinRate", "AvgProfit", "MedProfit", "AvgDD", "MaxDD", "AvgBE",
        "AvgEnd", "Expect"
    );
    println!("  {}", "-".repeat(110));
    for a in analyses {
        let config = config_column(&a.config);
        println!(
            "  {:<22} {:>5} {:>7} {:>7.1}% {:>8}% {:>8}% {:>7.2}% {:>7.2}% {:>7} {:>7}% {:>8}",
            config,
            a.runs,
            a.total_events,
            a.win_rate * Decimal::ONE_HUNDRED,
            signed(a.avg_max_profit, 2),
            signed(a.median_max_profit, 2),
            -a.avg_max_drawdown,
            -a.max_max_drawdown,
            a.avg_time_to_breakeven
                .map(|s| format!("{:.0}s", s))
                .unwrap_or_else(|| "N/A".to_string()),
            signed(a.avg_end_result, 2),
            signed(a.expectancy, 3),
        );
    }
}

/// `60s/2% r600 c600`
fn config_column(config: &DetectorConfig) -> String {
    format!(
        "{} r{} c{}",
        config.label(),
        config.record_after_seconds,
        config.cooldown_seconds
    )
}

async fn cmd_monitor(
    settings: &Settings,
    symbol: Option<&str>,
    config: Option<PathBuf>,
    pattern: &str,
    no_persist: bool,
) -> anyhow::Result<()> {
    let (pattern, config_path, file) = load_pattern_config(pattern, config)?;
    let symbols = resolve_symbols(symbol);

    info!(
        "Monitoring [{}] {} with {} config(s) from {}",
        pattern,
        symbols.join(", "),
        file.configs.len(),
        config_path.display()
    );

    let pool = if no_persist {
        None
    } else {
        Some(settings.open_db().await?.pool_clone())
    };

    tokio::select! {
        _ = run_monitor(&symbols, &file.configs, pool, &settings.ws_url, ReconnectPolicy::default()) => {
            info!("All monitors stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    Ok(())
}
