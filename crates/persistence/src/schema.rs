//! Database schema definitions

/// SQL to create all tables
/// NOTE: prices, percentages and durations are TEXT to preserve rust_decimal::Decimal precision.
/// Timestamps are INTEGER Unix milliseconds.
pub const CREATE_TABLES: &str = r#"
-- One row per (symbol, target range, detector config)
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    range_label TEXT NOT NULL,
    from_time INTEGER NOT NULL,
    to_time INTEGER NOT NULL,
    window_seconds INTEGER NOT NULL,
    drop_percent TEXT NOT NULL,
    record_after_seconds INTEGER NOT NULL,
    cooldown_seconds INTEGER NOT NULL,
    events_found INTEGER NOT NULL DEFAULT 0,
    profitable_count INTEGER NOT NULL DEFAULT 0,
    win_rate TEXT,
    avg_max_profit TEXT,
    median_max_profit TEXT,
    avg_max_drawdown TEXT,
    median_max_drawdown TEXT,
    max_max_drawdown TEXT,
    avg_time_to_breakeven TEXT,
    median_time_to_breakeven TEXT,
    avg_time_to_max_profit TEXT,
    avg_end_result TEXT,
    recovery_json TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS backtest_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES backtest_runs(id) ON DELETE CASCADE,
    event_uid TEXT NOT NULL,
    symbol TEXT NOT NULL,
    trigger_price TEXT NOT NULL,
    trigger_timestamp INTEGER NOT NULL,
    window_high TEXT NOT NULL,
    drop_percent TEXT NOT NULL,
    config_drop_percent TEXT NOT NULL,
    lowest_price TEXT NOT NULL,
    lowest_price_timestamp INTEGER NOT NULL,
    window_seconds INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backtest_price_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES backtest_events(id) ON DELETE CASCADE,
    phase TEXT NOT NULL CHECK (phase IN ('before', 'after')),
    timestamp INTEGER NOT NULL,
    price TEXT NOT NULL
);

-- Events captured by the live monitor
CREATE TABLE IF NOT EXISTS live_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_uid TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    trigger_price TEXT NOT NULL,
    trigger_timestamp INTEGER NOT NULL,
    window_high TEXT NOT NULL,
    drop_percent TEXT NOT NULL,
    config_drop_percent TEXT NOT NULL,
    lowest_price TEXT NOT NULL,
    lowest_price_timestamp INTEGER NOT NULL,
    window_seconds INTEGER NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS live_price_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES live_events(id) ON DELETE CASCADE,
    phase TEXT NOT NULL CHECK (phase IN ('before', 'after')),
    timestamp INTEGER NOT NULL,
    price TEXT NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_runs_symbol_range ON backtest_runs(symbol, from_time, to_time);
CREATE INDEX IF NOT EXISTS idx_runs_config ON backtest_runs(window_seconds, drop_percent, record_after_seconds, cooldown_seconds);
CREATE INDEX IF NOT EXISTS idx_events_run ON backtest_events(run_id);
CREATE INDEX IF NOT EXISTS idx_points_event_phase ON backtest_price_points(event_id, phase);
CREATE INDEX IF NOT EXISTS idx_live_events_symbol ON live_events(symbol, trigger_timestamp);
CREATE INDEX IF NOT EXISTS idx_live_points_event_phase ON live_price_points(event_id, phase)
"#;

/// `CREATE_TABLES` split into executable statements, comment lines removed
pub fn statements() -> impl Iterator<Item = String> {
    CREATE_TABLES.split(';').filter_map(|statement| {
        let sql = statement
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let sql = sql.trim();
        (!sql.is_empty()).then(|| sql.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_skip_comments_and_blanks() {
        let statements: Vec<String> = statements().collect();
        assert_eq!(statements.len(), 11);
        assert!(statements.iter().all(|s| s.starts_with("CREATE ")));
    }
}
