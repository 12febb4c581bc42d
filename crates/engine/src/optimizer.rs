//! Exhaustive grid search over SMA window pairs
//!
//! Every pair in the cartesian product of two window ranges is backtested and
//! the pair with the highest final strategy growth wins. Ties go to the first
//! pair in grid order (short window outer, long window inner). Pairs without
//! enough history are skipped, never fatal.

use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{evaluate, BacktestEngine};
use crate::error::{BacktestError, Result};
use crate::types::{BacktestResult, CandidateScore, OptimizationResult, ParameterPair, PriceSeries};

// ============================================================================
// Types
// ============================================================================

/// Evenly spaced window lengths `start, start + step, ...` below `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub start: usize,
    /// Exclusive upper bound
    pub stop: usize,
    pub step: usize,
}

impl WindowRange {
    pub fn new(start: usize, stop: usize, step: usize) -> Self {
        Self { start, stop, step }
    }

    pub fn validate(&self) -> Result<()> {
        if self.step == 0 || self.start >= self.stop {
            return Err(BacktestError::InvalidRange {
                start: self.start,
                stop: self.stop,
                step: self.step,
            });
        }
        if self.start == 0 {
            return Err(BacktestError::InvalidWindow {
                name: "range start",
                value: 0,
            });
        }
        Ok(())
    }

    pub fn values(&self) -> Result<Vec<usize>> {
        self.validate()?;
        Ok((self.start..self.stop).step_by(self.step).collect())
    }
}

impl FromStr for WindowRange {
    type Err = anyhow::Error;

    /// Parses `start,stop,step`
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<usize> = s
            .split(',')
            .map(|p| p.trim().parse::<usize>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid range '{}': {}", s, e))?;

        match parts.as_slice() {
            [start, stop, step] => Ok(Self::new(*start, *stop, *step)),
            _ => anyhow::bail!("Invalid range '{}': expected start,stop,step", s),
        }
    }
}

impl std::fmt::Display for WindowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.start, self.stop, self.step)
    }
}

/// Cartesian product of both ranges in search order
pub fn generate_grid(short: &WindowRange, long: &WindowRange) -> Result<Vec<ParameterPair>> {
    let shorts = short.values()?;
    let longs = long.values()?;

    let mut grid = Vec::with_capacity(shorts.len() * longs.len());
    for &s in &shorts {
        for &l in &longs {
            grid.push(ParameterPair::new(s, l));
        }
    }
    Ok(grid)
}

/// Request to start an optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub short_range: WindowRange,
    pub long_range: WindowRange,
    /// Number of ranked candidates to report (default 5)
    pub top_n: Option<usize>,
}

/// Optimization run status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    FetchingData,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress tracker between API handler and background task
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    running: AtomicBool,
    pub result: RwLock<Option<OptimizationResult>>,
    pub error_message: RwLock<Option<String>>,
    pub request: RwLock<Option<OptimizeRequest>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            result: RwLock::new(None),
            error_message: RwLock::new(None),
            request: RwLock::new(None),
        }
    }

    /// Claim the tracker for a new run and reset it.
    ///
    /// Returns false, leaving everything untouched, while another run holds it.
    pub fn try_start(&self, request: OptimizeRequest) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.reset(request);
        true
    }

    fn reset(&self, request: OptimizeRequest) {
        *self.status.write().unwrap() = OptimizeStatus::FetchingData;
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.result.write().unwrap() = None;
        *self.error_message.write().unwrap() = None;
        *self.request.write().unwrap() = Some(request);
    }

    /// Record a failure and stop
    pub fn fail(&self, message: impl Into<String>) {
        *self.error_message.write().unwrap() = Some(message.into());
        self.finish(OptimizeStatus::Error);
    }

    /// Publish a terminal status and release the tracker
    fn finish(&self, status: OptimizeStatus) {
        *self.status.write().unwrap() = status;
        self.running.store(false, Ordering::Release);
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Best-so-far tracking
// ============================================================================

#[derive(Default)]
struct BestTracker {
    best: Option<CandidateScore>,
    candidates: Vec<CandidateScore>,
    evaluated: usize,
    infeasible: usize,
}

impl BestTracker {
    /// Feed candidates in grid order. Only a strictly better score replaces the best.
    fn record(&mut self, parameters: ParameterPair, outcome: Result<BacktestResult>) -> Result<()> {
        self.evaluated += 1;
        match outcome {
            Ok(result) => {
                let score = CandidateScore {
                    parameters,
                    absolute_performance: result.absolute_performance,
                    outperformance: result.outperformance,
                };
                let improves = self
                    .best
                    .map_or(true, |b| score.absolute_performance > b.absolute_performance);
                if improves {
                    self.best = Some(score);
                }
                self.candidates.push(score);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                debug!(%parameters, error = %e, "Candidate skipped");
                self.infeasible += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finish(self) -> Result<OptimizationResult> {
        let best = self.best.ok_or(BacktestError::NoFeasibleParameters {
            evaluated: self.evaluated,
        })?;

        info!(
            best = %best.parameters,
            absolute = best.absolute_performance,
            evaluated = self.evaluated,
            infeasible = self.infeasible,
            "Best configuration found"
        );

        Ok(OptimizationResult {
            best: best.parameters,
            best_absolute_performance: best.absolute_performance,
            evaluated: self.evaluated,
            infeasible: self.infeasible,
            candidates: self.candidates,
        })
    }
}

// ============================================================================
// Search
// ============================================================================

/// Grid search driving a single engine through every window pair.
///
/// The engine ends up configured with the best pair and holds its result table.
pub fn optimize(
    engine: &mut BacktestEngine,
    short: &WindowRange,
    long: &WindowRange,
) -> Result<OptimizationResult> {
    let grid = generate_grid(short, long)?;

    info!(
        symbol = %engine.config().symbol,
        combinations = grid.len(),
        "Starting parameter optimization"
    );

    let mut tracker = BestTracker::default();
    for params in &grid {
        engine.set_parameters(Some(params.window_short), Some(params.window_long))?;
        let outcome = engine.run_strategy();
        tracker.record(*params, outcome)?;
    }

    let result = tracker.finish()?;

    engine.set_parameters(Some(result.best.window_short), Some(result.best.window_long))?;
    engine.run_strategy()?;

    Ok(result)
}

/// Same search as [`optimize`], evaluating candidates on the rayon pool.
///
/// Each worker builds its own derived columns over the shared read-only prices.
/// Results are reduced in grid order, so the winner matches the sequential search.
pub fn optimize_parallel(
    prices: &PriceSeries,
    short: &WindowRange,
    long: &WindowRange,
) -> Result<OptimizationResult> {
    search_parallel(prices, short, long, None)
}

/// Parallel search reporting into `progress`; honours its cancel flag.
pub fn optimize_parallel_with_progress(
    prices: &PriceSeries,
    short: &WindowRange,
    long: &WindowRange,
    progress: &OptimizeProgress,
) -> Result<OptimizationResult> {
    search_parallel(prices, short, long, Some(progress))
}

fn search_parallel(
    prices: &PriceSeries,
    short: &WindowRange,
    long: &WindowRange,
    progress: Option<&OptimizeProgress>,
) -> Result<OptimizationResult> {
    let grid = generate_grid(short, long)?;

    info!(
        symbol = %prices.symbol(),
        combinations = grid.len(),
        threads = rayon::current_num_threads(),
        "Starting parallel parameter optimization"
    );

    if let Some(p) = progress {
        p.total_combinations.store(grid.len() as u32, Ordering::Relaxed);
    }

    let outcomes: Vec<Option<Result<BacktestResult>>> = grid
        .par_iter()
        .map(|params| {
            if progress.is_some_and(|p| p.cancelled.load(Ordering::Relaxed)) {
                return None;
            }
            let outcome = evaluate(prices, params.window_short, params.window_long)
                .map(|(result, _)| result);
            if let Some(p) = progress {
                p.completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(outcome)
        })
        .collect();

    if progress.is_some_and(|p| p.cancelled.load(Ordering::Relaxed)) {
        let completed = outcomes.iter().filter(|o| o.is_some()).count();
        warn!(completed, "Optimization cancelled");
        return Err(BacktestError::Cancelled { completed });
    }

    let mut tracker = BestTracker::default();
    for (params, outcome) in grid.iter().zip(outcomes.into_iter().flatten()) {
        tracker.record(*params, outcome)?;
    }
    tracker.finish()
}

/// Run a full background optimization and publish the outcome on `progress`.
///
/// Blocking; call from `spawn_blocking` when inside an async runtime.
pub fn run_optimization(prices: Arc<PriceSeries>, request: &OptimizeRequest, progress: &OptimizeProgress) {
    *progress.status.write().unwrap() = OptimizeStatus::Running;

    match optimize_parallel_with_progress(
        &prices,
        &request.short_range,
        &request.long_range,
        progress,
    ) {
        Ok(result) => {
            *progress.result.write().unwrap() = Some(result);
            progress.finish(OptimizeStatus::Complete);
            info!("Optimization complete");
        }
        Err(BacktestError::Cancelled { .. }) => {
            progress.finish(OptimizeStatus::Cancelled);
        }
        Err(e) => {
            warn!(error = %e, "Optimization failed");
            progress.fail(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BacktestConfig, PricePoint};
    use chrono::{Days, NaiveDate};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn make_series(prices: &[f64]) -> Arc<PriceSeries> {
        let start = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| PricePoint::new(start + Days::new(i as u64), p))
            .collect();
        Arc::new(PriceSeries::new("SYN", points).unwrap())
    }

    fn random_walk(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price = 50.0;
        (0..n)
            .map(|_| {
                price *= 1.0 + rng.gen_range(-0.04..0.04);
                price
            })
            .collect()
    }

    fn engine_for(prices: Arc<PriceSeries>) -> BacktestEngine {
        let config = BacktestConfig {
            symbol: "SYN".to_string(),
            window_short: 2,
            window_long: 5,
            ..Default::default()
        };
        BacktestEngine::from_series(config, prices).unwrap()
    }

    #[test]
    fn test_window_range_values() {
        assert_eq!(WindowRange::new(2, 5, 1).values().unwrap(), vec![2, 3, 4]);
        assert_eq!(WindowRange::new(20, 61, 20).values().unwrap(), vec![20, 40, 60]);
        assert_eq!(WindowRange::new(5, 6, 10).values().unwrap(), vec![5]);
    }

    #[test]
    fn test_window_range_rejects_bad_input() {
        assert!(matches!(
            WindowRange::new(5, 5, 1).values(),
            Err(BacktestError::InvalidRange { .. })
        ));
        assert!(matches!(
            WindowRange::new(1, 5, 0).values(),
            Err(BacktestError::InvalidRange { .. })
        ));
        assert!(matches!(
            WindowRange::new(0, 5, 1).values(),
            Err(BacktestError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_window_range_parse() {
        let r: WindowRange = "20, 61, 4".parse().unwrap();
        assert_eq!(r, WindowRange::new(20, 61, 4));
        assert_eq!(r.to_string(), "20,61,4");
        assert!("20,61".parse::<WindowRange>().is_err());
        assert!("a,b,c".parse::<WindowRange>().is_err());
    }

    #[test]
    fn test_grid_order_is_short_major() {
        let grid = generate_grid(&WindowRange::new(2, 4, 1), &WindowRange::new(5, 7, 1)).unwrap();
        assert_eq!(
            grid,
            vec![
                ParameterPair::new(2, 5),
                ParameterPair::new(2, 6),
                ParameterPair::new(3, 5),
                ParameterPair::new(3, 6),
            ]
        );
    }

    #[test]
    fn test_optimize_hand_computed_grid() {
        let prices = make_series(&[100.0, 110.0, 99.0, 120.0, 130.0]);
        let mut engine = engine_for(prices);
        let result = optimize(&mut engine, &WindowRange::new(1, 2, 1), &WindowRange::new(2, 5, 1))
            .unwrap();

        // (1,2): long, short, long over the last three sessions
        // (1,3): short, long over the last two
        // (1,4): long over the last one
        let expected = [
            (ParameterPair::new(1, 2), 0.9 * (99.0 / 120.0) * (130.0 / 120.0)),
            (ParameterPair::new(1, 3), (99.0 / 120.0) * (130.0 / 120.0)),
            (ParameterPair::new(1, 4), 130.0 / 120.0),
        ];
        assert_eq!(result.candidates.len(), 3);
        for (candidate, (pair, perf)) in result.candidates.iter().zip(expected) {
            assert_eq!(candidate.parameters, pair);
            assert!((candidate.absolute_performance - perf).abs() < 1e-12);
        }

        assert_eq!(result.best, ParameterPair::new(1, 4));
        assert!((result.best_absolute_performance - 13.0 / 12.0).abs() < 1e-12);
        assert_eq!(engine.parameters(), ParameterPair::new(1, 4));
    }

    #[test]
    fn test_optimize_finds_exhaustive_maximum() {
        let prices = make_series(&random_walk(90, 42));
        let short = WindowRange::new(2, 5, 1);
        let long = WindowRange::new(5, 8, 1);

        // Independent evaluation of all 9 pairs
        let mut expected: Option<(ParameterPair, f64)> = None;
        for s in 2..5 {
            for l in 5..8 {
                let (r, _) = evaluate(&prices, s, l).unwrap();
                if expected.map_or(true, |(_, best)| r.absolute_performance > best) {
                    expected = Some((ParameterPair::new(s, l), r.absolute_performance));
                }
            }
        }
        let (best_pair, best_perf) = expected.unwrap();

        let mut engine = engine_for(prices);
        let result = optimize(&mut engine, &short, &long).unwrap();
        assert_eq!(result.best, best_pair);
        assert_eq!(result.best_absolute_performance, best_perf);
        assert_eq!(result.evaluated, 9);
        assert_eq!(result.infeasible, 0);
        assert_eq!(result.candidates.len(), 9);
        assert!(result
            .candidates
            .iter()
            .all(|c| c.absolute_performance <= best_perf));
    }

    #[test]
    fn test_optimize_leaves_engine_on_best_pair() {
        let prices = make_series(&random_walk(90, 8));
        let mut engine = engine_for(prices.clone());
        let result =
            optimize(&mut engine, &WindowRange::new(2, 6, 1), &WindowRange::new(8, 20, 3)).unwrap();

        assert_eq!(engine.parameters(), result.best);
        let table = engine.results().unwrap();
        assert_eq!(table.parameters, result.best);
        let (_, expected) = evaluate(&prices, result.best.window_short, result.best.window_long).unwrap();
        assert_eq!(table, &expected);
    }

    #[test]
    fn test_ties_go_to_first_pair() {
        // Flat prices: every pair ends at exactly 1.0
        let prices = make_series(&[100.0; 30]);
        let mut engine = engine_for(prices.clone());
        let short = WindowRange::new(2, 5, 1);
        let long = WindowRange::new(5, 8, 1);

        let result = optimize(&mut engine, &short, &long).unwrap();
        assert_eq!(result.best, ParameterPair::new(2, 5));
        assert_eq!(result.best_absolute_performance, 1.0);

        let parallel = optimize_parallel(&prices, &short, &long).unwrap();
        assert_eq!(parallel.best, ParameterPair::new(2, 5));
    }

    #[test]
    fn test_infeasible_candidates_are_skipped() {
        let prices = make_series(&random_walk(12, 5));
        let mut engine = engine_for(prices);
        let result =
            optimize(&mut engine, &WindowRange::new(2, 4, 1), &WindowRange::new(5, 25, 10)).unwrap();

        assert_eq!(result.evaluated, 4);
        assert_eq!(result.infeasible, 2);
        assert!(result.candidates.iter().all(|c| c.parameters.window_long == 5));
        assert_eq!(result.best.window_long, 5);
    }

    #[test]
    fn test_no_feasible_parameters() {
        let prices = make_series(&random_walk(10, 5));
        let mut engine = engine_for(prices.clone());
        let short = WindowRange::new(20, 23, 1);
        let long = WindowRange::new(30, 32, 1);

        assert_eq!(
            optimize(&mut engine, &short, &long).unwrap_err(),
            BacktestError::NoFeasibleParameters { evaluated: 6 }
        );
        assert_eq!(
            optimize_parallel(&prices, &short, &long).unwrap_err(),
            BacktestError::NoFeasibleParameters { evaluated: 6 }
        );
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let prices = make_series(&random_walk(250, 99));
        let short = WindowRange::new(2, 30, 3);
        let long = WindowRange::new(10, 120, 10);

        let mut engine = engine_for(prices.clone());
        let sequential = optimize(&mut engine, &short, &long).unwrap();
        let parallel = optimize_parallel(&prices, &short, &long).unwrap();

        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_progress_tracks_completion() {
        let prices = make_series(&random_walk(80, 13));
        let request = OptimizeRequest {
            symbol: "SYN".to_string(),
            start: NaiveDate::from_ymd_opt(2022, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            short_range: WindowRange::new(2, 6, 1),
            long_range: WindowRange::new(10, 30, 5),
            top_n: None,
        };
        let progress = OptimizeProgress::new();
        assert!(progress.try_start(request.clone()));
        assert!(progress.is_running());

        run_optimization(prices, &request, &progress);

        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Complete);
        assert_eq!(progress.total_combinations.load(Ordering::Relaxed), 16);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 16);
        assert_eq!(progress.progress_pct(), 100.0);
        assert!(progress.result.read().unwrap().is_some());
        assert!(!progress.is_running());
    }

    #[test]
    fn test_only_one_concurrent_start_wins() {
        let request = OptimizeRequest {
            symbol: "SYN".to_string(),
            start: NaiveDate::from_ymd_opt(2022, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            short_range: WindowRange::new(2, 4, 1),
            long_range: WindowRange::new(10, 20, 5),
            top_n: None,
        };
        let progress = OptimizeProgress::new();

        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| progress.try_start(request.clone())))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count()
        });
        assert_eq!(wins, 1);
        assert!(!progress.try_start(request.clone()));

        progress.fail("stopped");
        assert!(!progress.is_running());
        assert!(progress.try_start(request));
        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::FetchingData);
        assert!(progress.error_message.read().unwrap().is_none());
    }

    #[test]
    fn test_cancelled_search() {
        let prices = make_series(&random_walk(80, 13));
        let progress = OptimizeProgress::new();
        progress.cancelled.store(true, Ordering::Relaxed);

        let err = optimize_parallel_with_progress(
            &prices,
            &WindowRange::new(2, 6, 1),
            &WindowRange::new(10, 30, 5),
            &progress,
        )
        .unwrap_err();
        assert_eq!(err, BacktestError::Cancelled { completed: 0 });
    }

    #[test]
    fn test_failed_run_reports_error() {
        let prices = make_series(&random_walk(10, 1));
        let request = OptimizeRequest {
            symbol: "SYN".to_string(),
            start: NaiveDate::from_ymd_opt(2022, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2022, 7, 1).unwrap(),
            short_range: WindowRange::new(40, 42, 1),
            long_range: WindowRange::new(50, 52, 1),
            top_n: Some(3),
        };
        let progress = OptimizeProgress::new();
        run_optimization(prices, &request, &progress);

        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Error);
        assert!(progress.error_message.read().unwrap().is_some());
    }
}
