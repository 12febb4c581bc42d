//! Database schema definitions

/// SQL to create all tables
/// NOTE: performance figures stored as TEXT to keep the exact reported decimals
pub const CREATE_TABLES: &str = r#"
-- Completed optimization runs
CREATE TABLE IF NOT EXISTS optimization_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    short_range TEXT NOT NULL,
    long_range TEXT NOT NULL,
    best_short INTEGER NOT NULL,
    best_long INTEGER NOT NULL,
    absolute_performance TEXT NOT NULL DEFAULT '0',
    outperformance TEXT NOT NULL DEFAULT '0',
    evaluated INTEGER NOT NULL DEFAULT 0,
    infeasible INTEGER NOT NULL DEFAULT 0,
    candidates_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_optimization_symbol ON optimization_runs(symbol);
CREATE INDEX IF NOT EXISTS idx_optimization_created ON optimization_runs(created_at DESC)
"#;
