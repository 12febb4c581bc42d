//! SMA Backtest - dual moving-average crossover research tool
//!
//! Usage:
//!   sma-backtest backtest --symbol BTCUSDT --short 42 --long 252   - Single backtest
//!   sma-backtest optimize --symbol BTCUSDT --parallel              - Grid search
//!   sma-backtest history                                           - Stored searches
//!   sma-backtest serve --port 3001                                 - JSON API

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use engine::{
    evaluate, optimize, optimize_parallel, BacktestConfig, BacktestEngine, BacktestResult,
    BinanceClient, InMemoryProvider, OptimizationResult, PriceProvider, WindowRange,
};
use persistence::repository::{compute_run_hash, OptimizationRunRecord};
use tracing::info;

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "sma-backtest")]
#[command(about = "Backtest and optimize a dual SMA crossover strategy", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a single window pair
    Backtest {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// Short SMA window
        #[arg(long, default_value_t = 42)]
        short: usize,
        /// Long SMA window
        #[arg(long, default_value_t = 252)]
        long: usize,
        /// First date (YYYY-MM-DD)
        #[arg(long, default_value = "2020-01-01")]
        start: NaiveDate,
        /// End date, exclusive (YYYY-MM-DD)
        #[arg(long, default_value = "2024-01-01")]
        end: NaiveDate,
        /// Read prices from a JSON file instead of Binance
        #[arg(long)]
        data_file: Option<PathBuf>,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Grid-search window pairs for the best final performance
    Optimize {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(long, default_value = "2020-01-01")]
        start: NaiveDate,
        #[arg(long, default_value = "2024-01-01")]
        end: NaiveDate,
        /// Short windows as start,stop,step (stop exclusive)
        #[arg(long, default_value = "20,61,4")]
        short_range: WindowRange,
        /// Long windows as start,stop,step (stop exclusive)
        #[arg(long, default_value = "180,281,10")]
        long_range: WindowRange,
        /// Evaluate candidates on all cores
        #[arg(long)]
        parallel: bool,
        /// Number of ranked candidates to print
        #[arg(long, default_value_t = 5)]
        top_n: usize,
        /// Store the run in the history database
        #[arg(long)]
        save: bool,
        #[arg(long)]
        data_file: Option<PathBuf>,
        #[arg(long)]
        export: Option<String>,
    },
    /// Show stored optimization runs
    History {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Launch the JSON API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,sma_backtest=debug")
    } else {
        EnvFilter::new("info,engine=info,sma_backtest=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

pub(crate) fn db_path() -> String {
    std::env::var("SMA_BACKTEST_DB_PATH").unwrap_or_else(|_| "data/backtests.db".to_string())
}

pub(crate) fn binance_client() -> BinanceClient {
    match std::env::var("BINANCE_BASE_URL") {
        Ok(url) => BinanceClient::with_base_url(url),
        Err(_) => BinanceClient::new(),
    }
}

fn load_provider(symbol: &str, data_file: Option<PathBuf>) -> anyhow::Result<Box<dyn PriceProvider>> {
    match data_file {
        Some(path) => {
            info!(path = %path.display(), "Using offline price file");
            Ok(Box::new(InMemoryProvider::from_json_file(symbol, path)?))
        }
        None => Ok(Box::new(binance_client())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Backtest {
            symbol,
            short,
            long,
            start,
            end,
            data_file,
            export,
        } => {
            let config = BacktestConfig {
                symbol,
                window_short: short,
                window_long: long,
                start,
                end,
            };
            cmd_backtest(config, data_file, export).await?;
        }
        Commands::Optimize {
            symbol,
            start,
            end,
            short_range,
            long_range,
            parallel,
            top_n,
            save,
            data_file,
            export,
        } => {
            let opts = OptimizeOptions {
                symbol,
                start,
                end,
                short_range,
                long_range,
                parallel,
                top_n,
                save,
                data_file,
                export,
            };
            cmd_optimize(opts).await?;
        }
        Commands::History { symbol, limit } => {
            cmd_history(symbol, limit).await?;
        }
        Commands::Serve { host, port } => {
            api::serve(&host, port).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(
    config: BacktestConfig,
    data_file: Option<PathBuf>,
    export: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== SMA Backtest v{} ===", APP_VERSION);

    let provider = load_provider(&config.symbol, data_file)?;
    let mut engine = BacktestEngine::fetch(provider.as_ref(), config).await?;
    let result = engine.run_strategy()?;
    let table = engine.results()?;

    println!("{}", engine.chart_title());
    println!(
        "Sessions: {} fetched, {} traded",
        engine.prices().len(),
        table.len()
    );
    print_result(&result);

    if let Some(path) = export {
        let json = serde_json::json!({
            "title": engine.chart_title(),
            "parameters": engine.parameters(),
            "result": result,
            "summary": result.rounded(),
            "curve": table.performance_curve(),
        });
        std::fs::write(&path, serde_json::to_string_pretty(&json)?)?;
        println!("Exported to {}", path);
    }

    Ok(())
}

fn print_result(result: &BacktestResult) {
    let summary = result.rounded();
    println!("  Absolute performance: {}", summary.absolute_performance);
    println!("  Outperformance:       {}", summary.outperformance);
}

// ============================================================================
// Optimize command
// ============================================================================

struct OptimizeOptions {
    symbol: String,
    start: NaiveDate,
    end: NaiveDate,
    short_range: WindowRange,
    long_range: WindowRange,
    parallel: bool,
    top_n: usize,
    save: bool,
    data_file: Option<PathBuf>,
    export: Option<String>,
}

async fn cmd_optimize(opts: OptimizeOptions) -> anyhow::Result<()> {
    println!("\n=== SMA Backtest v{} ===", APP_VERSION);
    println!(
        "Symbol: {} | {} .. {} | SMA1 {} | SMA2 {} | Mode: {}",
        opts.symbol,
        opts.start,
        opts.end,
        opts.short_range,
        opts.long_range,
        if opts.parallel { "parallel" } else { "sequential" }
    );

    let provider = load_provider(&opts.symbol, opts.data_file.clone())?;
    let prices = Arc::new(provider.fetch(&opts.symbol, opts.start, opts.end).await?);
    println!("Sessions: {}", prices.len());

    let short = opts.short_range;
    let long = opts.long_range;
    let parallel = opts.parallel;
    let config = BacktestConfig {
        symbol: opts.symbol.clone(),
        window_short: short.start.max(1),
        window_long: long.start.max(1),
        start: opts.start,
        end: opts.end,
    };

    let search_prices = prices.clone();
    let (result, best) = tokio::task::spawn_blocking(move || -> engine::Result<_> {
        if parallel {
            let result = optimize_parallel(&search_prices, &short, &long)?;
            let (best, _) =
                evaluate(&search_prices, result.best.window_short, result.best.window_long)?;
            Ok((result, best))
        } else {
            let mut engine = BacktestEngine::from_series(config, search_prices)?;
            let result = optimize(&mut engine, &short, &long)?;
            let best = engine.run_strategy()?;
            Ok((result, best))
        }
    })
    .await??;

    println!(
        "\nBest: {} ({} evaluated, {} infeasible)",
        result.best, result.evaluated, result.infeasible
    );
    print_result(&best);

    println!("\nTop {}:", opts.top_n);
    for (i, c) in result.top(opts.top_n).iter().enumerate() {
        let summary = BacktestResult {
            absolute_performance: c.absolute_performance,
            outperformance: c.outperformance,
        }
        .rounded();
        println!(
            "  #{:<2} {:<20} abs {:>8}  out {:>8}",
            i + 1,
            c.parameters.to_string(),
            summary.absolute_performance,
            summary.outperformance
        );
    }

    if opts.save {
        let store = persistence::RunStore::open(db_path()).await?;
        let record = run_record(
            &opts.symbol,
            opts.start,
            opts.end,
            &short,
            &long,
            &result,
            &best,
        )?;
        store.runs().save(&record).await?;
        println!("\nSaved to {}", db_path());
    }

    if let Some(path) = opts.export {
        let json = serde_json::json!({
            "symbol": opts.symbol,
            "start": opts.start,
            "end": opts.end,
            "short_range": short,
            "long_range": long,
            "best": result.best,
            "result": best,
            "summary": best.rounded(),
            "top": result.top(opts.top_n),
            "evaluated": result.evaluated,
            "infeasible": result.infeasible,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&json)?)?;
        println!("Exported to {}", path);
    }

    Ok(())
}

/// Build the history record for a finished search
pub(crate) fn run_record(
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
    short: &WindowRange,
    long: &WindowRange,
    result: &OptimizationResult,
    best: &BacktestResult,
) -> anyhow::Result<OptimizationRunRecord> {
    let (start, end) = (start.to_string(), end.to_string());
    let (short, long) = (short.to_string(), long.to_string());
    let summary = best.rounded();

    Ok(OptimizationRunRecord {
        id: None,
        run_hash: compute_run_hash(symbol, &start, &end, &short, &long),
        symbol: symbol.to_string(),
        start_date: start,
        end_date: end,
        short_range: short,
        long_range: long,
        best_short: result.best.window_short as i64,
        best_long: result.best.window_long as i64,
        absolute_performance: summary.absolute_performance.to_string(),
        outperformance: summary.outperformance.to_string(),
        evaluated: result.evaluated as i64,
        infeasible: result.infeasible as i64,
        candidates_json: serde_json::to_string(&result.candidates)?,
        created_at: None,
    })
}

// ============================================================================
// History command
// ============================================================================

async fn cmd_history(symbol: Option<String>, limit: i64) -> anyhow::Result<()> {
    let store = persistence::RunStore::open(db_path()).await?;
    let repo = store.runs();

    let runs = repo.get_recent(limit, symbol.as_deref()).await?;
    println!(
        "\n=== Optimization history ({} of {} runs) ===",
        runs.len(),
        repo.count().await?
    );

    for run in runs {
        println!(
            "  {:<10} {} .. {}  SMA1 {:<10} SMA2 {:<12} best {}/{}  abs {:>6}  out {:>6}  ({} evaluated)",
            run.symbol,
            run.start_date,
            run.end_date,
            run.short_range,
            run.long_range,
            run.best_short,
            run.best_long,
            run.absolute_performance,
            run.outperformance,
            run.evaluated
        );
    }

    Ok(())
}
