//! SMA feature computation over the analytics store.

use crate::error::{FinError, FinResult};
use crate::storage::AnalyticsStore;

const TECHNICALS_SOURCE: &str = "stage1_sma";

/// Recompute SMA features for the universe/date range using window
/// aggregates. Previous rows from this source are replaced wholesale.
pub fn compute_sma_features(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    short_window: i64,
    long_window: i64,
) -> FinResult<i64> {
    if short_window < 1 || long_window < 2 || short_window >= long_window {
        return Err(FinError::invalid(
            "invalid windows: require 1 <= short_window < long_window",
        ));
    }
    if universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }

    let placeholders = vec!["?"; universe.len()].join(",");
    let insert_sql = format!(
        "INSERT INTO market_technicals (timestamp, symbol, sma_short, sma_long, source)
         SELECT
           timestamp,
           symbol,
           AVG(close) OVER (
               PARTITION BY symbol ORDER BY timestamp
               ROWS BETWEEN {short_preceding} PRECEDING AND CURRENT ROW
           ) AS sma_short,
           AVG(close) OVER (
               PARTITION BY symbol ORDER BY timestamp
               ROWS BETWEEN {long_preceding} PRECEDING AND CURRENT ROW
           ) AS sma_long,
           '{source}'
         FROM market_ohlcv
         WHERE symbol IN ({placeholders})
           AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
         ORDER BY symbol, timestamp",
        short_preceding = short_window - 1,
        long_preceding = long_window - 1,
        source = TECHNICALS_SOURCE,
    );

    let mut bind: Vec<String> = universe.to_vec();
    bind.push(start_date.to_string());
    bind.push(end_date.to_string());

    let before;
    let after;
    {
        let conn = analytics.conn();
        conn.execute(
            &format!("DELETE FROM market_technicals WHERE source = '{}'", TECHNICALS_SOURCE),
            [],
        )?;
        before = conn.query_row("SELECT COUNT(*) FROM market_technicals", [], |row| {
            row.get::<_, i64>(0)
        })?;
        conn.execute(&insert_sql, duckdb::params_from_iter(bind.iter()))?;
        after = conn.query_row("SELECT COUNT(*) FROM market_technicals", [], |row| {
            row.get::<_, i64>(0)
        })?;
    }

    let inserted = after - before;
    if inserted <= 0 {
        return Err(FinError::invalid("no technical rows generated"));
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_windows() {
        let analytics = AnalyticsStore::in_memory().unwrap();
        let universe = vec!["ABC".to_string()];
        assert!(compute_sma_features(&analytics, &universe, "2025-01-01", "2025-01-31", 5, 5).is_err());
        assert!(compute_sma_features(&analytics, &universe, "2025-01-01", "2025-01-31", 0, 5).is_err());
    }

    #[test]
    fn test_computes_windowed_averages() {
        let analytics = AnalyticsStore::in_memory().unwrap();
        {
            let conn = analytics.conn();
            conn.execute_batch(
                "INSERT INTO market_ohlcv VALUES
                   ('2025-01-01', '2025-01-01', 'ABC', 1, 1, 1, 10, 100, 's.csv', 'h', '2025-01-01'),
                   ('2025-01-02', '2025-01-02', 'ABC', 1, 1, 1, 20, 100, 's.csv', 'h', '2025-01-02'),
                   ('2025-01-03', '2025-01-03', 'ABC', 1, 1, 1, 30, 100, 's.csv', 'h', '2025-01-03');",
            )
            .unwrap();
        }
        let inserted = compute_sma_features(
            &analytics,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
            2,
            3,
        )
        .unwrap();
        assert_eq!(inserted, 3);
        let (short, long): (f64, f64) = analytics
            .conn()
            .query_row(
                "SELECT sma_short, sma_long FROM market_technicals
                 WHERE symbol = 'ABC' ORDER BY timestamp DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((short - 25.0).abs() < 1e-9);
        assert!((long - 20.0).abs() < 1e-9);
    }
}
