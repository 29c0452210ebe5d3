//! Universe resolution against locally imported data.

use crate::error::{FinError, FinResult};
use crate::storage::AnalyticsStore;

/// Confirm every requested symbol has OHLCV rows; returns the sorted
/// deduplicated universe or fails listing the missing symbols.
pub fn resolve_universe(
    analytics: &AnalyticsStore,
    requested_symbols: &[String],
) -> FinResult<Vec<String>> {
    if requested_symbols.is_empty() {
        return Err(FinError::invalid("requested_symbols must not be empty"));
    }

    let placeholders = vec!["?"; requested_symbols.len()].join(",");
    let sql = format!(
        "SELECT DISTINCT symbol FROM market_ohlcv WHERE symbol IN ({placeholders}) ORDER BY symbol"
    );
    let conn = analytics.conn();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params_from_iter(requested_symbols.iter()), |row| {
        row.get::<_, String>(0)
    })?;
    let mut found = Vec::new();
    for row in rows {
        found.push(row?);
    }

    let mut missing: Vec<&String> = requested_symbols
        .iter()
        .filter(|symbol| !found.contains(symbol))
        .collect();
    missing.sort();
    missing.dedup();
    if !missing.is_empty() {
        return Err(FinError::invalid(format!(
            "symbols not found in local data: {:?}",
            missing
        )));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_universe_reports_missing() {
        let analytics = AnalyticsStore::in_memory().unwrap();
        analytics
            .conn()
            .execute_batch(
                "INSERT INTO market_ohlcv VALUES
                   ('2025-01-01', '2025-01-01', 'ABC', 1, 1, 1, 1.5, 100, 's.csv', 'h', '2025-01-01');",
            )
            .unwrap();
        let ok = resolve_universe(&analytics, &["ABC".to_string()]).unwrap();
        assert_eq!(ok, vec!["ABC".to_string()]);
        let err =
            resolve_universe(&analytics, &["ABC".to_string(), "NOPE".to_string()]).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }
}
