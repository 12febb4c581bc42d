//! JSON API over the backtest engine and optimizer

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use engine::{
    evaluate, run_optimization, BacktestConfig, BacktestEngine, OptimizeProgress, OptimizeRequest,
    PriceProvider,
};
use persistence::RunStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::{binance_client, db_path, run_record, APP_VERSION};

const DEFAULT_TOP_N: usize = 5;

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn PriceProvider>,
    store: RunStore,
    optimize_progress: Arc<OptimizeProgress>,
}

pub async fn serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("SMA Backtest v{} starting...", APP_VERSION);

    let db_path = db_path();
    let store = RunStore::open(&db_path).await.map_err(|e| {
        error!("Failed to open run store: {}", e);
        e
    })?;

    let state = AppState {
        provider: Arc::new(binance_client()),
        store,
        optimize_progress: Arc::new(OptimizeProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_backtest))
        .route("/optimize", post(api_start_optimization))
        .route("/optimize/status", get(api_optimize_status))
        .route("/optimize/cancel", post(api_cancel_optimization))
        .route("/history", get(api_history))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== SMA Backtest v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/backtest            - Backtest one window pair");
    println!("  POST /api/optimize            - Start grid search");
    println!("  GET  /api/optimize/status     - Poll grid search progress");
    println!("  POST /api/optimize/cancel     - Cancel running grid search");
    println!("  GET  /api/history             - Stored optimization runs");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": APP_VERSION,
    }))
}

// ============================================================================
// API Handlers - Backtest
// ============================================================================

/// POST /api/backtest - Backtest one window pair and return the growth curves
async fn api_backtest(
    State(state): State<AppState>,
    Json(config): Json<BacktestConfig>,
) -> Json<serde_json::Value> {
    info!(
        symbol = %config.symbol,
        sma1 = config.window_short,
        sma2 = config.window_long,
        "Backtest requested"
    );

    let mut engine = match BacktestEngine::fetch(state.provider.as_ref(), config).await {
        Ok(e) => e,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    };

    match engine.run_strategy() {
        Ok(result) => {
            let curve = engine
                .results()
                .map(|t| t.performance_curve())
                .unwrap_or_default();
            Json(serde_json::json!({
                "success": true,
                "title": engine.chart_title(),
                "parameters": engine.parameters(),
                "result": result,
                "summary": result.rounded(),
                "curve": curve,
            }))
        }
        Err(e) => Json(serde_json::json!({
            "success": false,
            "message": e.to_string(),
        })),
    }
}

// ============================================================================
// API Handlers - Optimizer
// ============================================================================

/// POST /api/optimize - Start a grid search in the background
async fn api_start_optimization(
    State(state): State<AppState>,
    Json(request): Json<OptimizeRequest>,
) -> Json<serde_json::Value> {
    let grid_size = match engine::generate_grid(&request.short_range, &request.long_range) {
        Ok(grid) => grid.len(),
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    };

    if !state.optimize_progress.try_start(request.clone()) {
        let pct = state.optimize_progress.progress_pct();
        return Json(serde_json::json!({
            "success": false,
            "message": format!("Optimization already in progress ({:.0}% complete)", pct),
        }));
    }

    info!(
        symbol = %request.symbol,
        short_range = %request.short_range,
        long_range = %request.long_range,
        "Starting parameter optimization"
    );

    let prices = match state
        .provider
        .fetch(&request.symbol, request.start, request.end)
        .await
    {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Failed to fetch prices for optimization: {}", e);
            state
                .optimize_progress
                .fail(format!("Failed to fetch prices: {}", e));
            return Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to fetch market data: {}", e),
            }));
        }
    };

    info!(sessions = prices.len(), "Prices fetched, spawning optimization task");

    let progress = state.optimize_progress.clone();
    let store = state.store.clone();
    tokio::spawn(async move {
        let task_prices = prices.clone();
        let task_request = request.clone();
        let task_progress = progress.clone();
        let joined = tokio::task::spawn_blocking(move || {
            run_optimization(task_prices, &task_request, &task_progress);
        })
        .await;

        if let Err(e) = joined {
            progress.fail(format!("Optimization task failed: {}", e));
            return;
        }

        let result = progress.result.read().unwrap().clone();
        if let Some(result) = result {
            if let Err(e) = save_run(&store, &prices, &request, &result) {
                warn!(error = %e, "Could not build history record");
            } else {
                info!(best = %result.best, "Saving optimization run");
            }
        }
    });

    Json(serde_json::json!({
        "success": true,
        "message": format!("Optimization started ({} combinations)", grid_size),
        "total_combinations": grid_size,
    }))
}

/// Persist a finished run; database errors are logged, not surfaced
fn save_run(
    store: &RunStore,
    prices: &engine::PriceSeries,
    request: &OptimizeRequest,
    result: &engine::OptimizationResult,
) -> anyhow::Result<()> {
    let (best, _) = evaluate(prices, result.best.window_short, result.best.window_long)?;
    let record = run_record(
        &request.symbol,
        request.start,
        request.end,
        &request.short_range,
        &request.long_range,
        result,
        &best,
    )?;

    let store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.runs().save(&record).await {
            error!("Failed to save optimization run: {}", e);
        }
    });
    Ok(())
}

/// GET /api/optimize/status - Poll optimization progress
async fn api_optimize_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.optimize_progress;
    let status = progress.status.read().unwrap().clone();
    let total = progress.total_combinations.load(Ordering::Relaxed);
    let completed = progress.completed.load(Ordering::Relaxed);
    let pct = progress.progress_pct();
    let error = progress.error_message.read().unwrap().clone();
    let request = progress.request.read().unwrap().clone();
    let top_n = request
        .as_ref()
        .and_then(|r| r.top_n)
        .unwrap_or(DEFAULT_TOP_N);

    let (best, best_absolute_performance, results) = match progress.result.read().unwrap().as_ref() {
        Some(r) => (
            Some(r.best),
            Some(r.best_absolute_performance),
            r.top(top_n),
        ),
        None => (None, None, Vec::new()),
    };

    Json(serde_json::json!({
        "status": status,
        "request": request,
        "progress_pct": pct,
        "completed": completed,
        "total": total,
        "best": best,
        "best_absolute_performance": best_absolute_performance,
        "results": results,
        "error": error,
    }))
}

/// POST /api/optimize/cancel - Request cancellation of the running search
async fn api_cancel_optimization(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.optimize_progress;
    if !progress.is_running() {
        return Json(serde_json::json!({
            "success": false,
            "message": "No optimization running",
        }));
    }

    progress.cancelled.store(true, Ordering::Relaxed);
    info!("Optimization cancel requested");

    Json(serde_json::json!({
        "success": true,
        "message": "Cancellation requested",
    }))
}

// ============================================================================
// API Handlers - History
// ============================================================================

/// GET /api/history - Stored optimization runs, newest first
async fn api_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let symbol = params.get("symbol").map(|s| s.as_str());
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    let repo = state.store.runs();
    match repo.get_recent(limit, symbol).await {
        Ok(runs) => Json(serde_json::json!({
            "success": true,
            "data": runs,
            "total": runs.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query history: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}
