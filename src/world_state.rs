//! World-state manifest builder and point-in-time validators.
//!
//! A manifest freezes the data subset backing a run: a deterministic sha256
//! over the sorted serialization of every selected OHLCV row, mixed with the
//! adjustment policy and the auxiliary fundamentals/actions/ratings counts.
//! Two manifests built over identical data are bit-identical regardless of
//! insertion order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{FinError, FinResult};
use crate::storage::{AnalyticsStore, StateStore};

pub const ADJUSTMENT_POLICIES: &[&str] = &["none", "split_adjusted", "total_return"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldStateManifest {
    pub manifest_id: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub data_hash: String,
    pub row_count: i64,
    pub fundamentals_row_count: i64,
    pub corporate_actions_row_count: i64,
    pub ratings_row_count: i64,
    pub adjustment_policy: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataCompletenessReport {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub strict_mode: bool,
    pub total_symbols: usize,
    pub covered_symbols: usize,
    pub skipped_instruments: Vec<serde_json::Value>,
    pub skipped_features: Vec<serde_json::Value>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PitValidationReport {
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub strict_mode: bool,
    pub valid: bool,
    pub errors: Vec<String>,
    pub remediation: Vec<String>,
    pub leak_rows: i64,
}

fn in_clause(universe: &[String]) -> String {
    vec!["?"; universe.len()].join(",")
}

/// Build and persist a manifest over `(universe, date range, policy)`.
pub fn build_world_state_manifest(
    analytics: &AnalyticsStore,
    state: &StateStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    adjustment_policy: &str,
) -> FinResult<WorldStateManifest> {
    if universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }
    let policy = adjustment_policy.trim().to_lowercase();
    if !ADJUSTMENT_POLICIES.contains(&policy.as_str()) {
        return Err(FinError::invalid(format!(
            "unsupported adjustment_policy={}; expected one of: none, split_adjusted, total_return",
            adjustment_policy
        )));
    }

    let placeholders = in_clause(universe);
    let rows_sql = format!(
        "SELECT
           symbol,
           CAST(timestamp AS VARCHAR),
           CAST(published_at AS VARCHAR),
           CAST(open AS VARCHAR),
           CAST(high AS VARCHAR),
           CAST(low AS VARCHAR),
           CAST(close AS VARCHAR),
           CAST(volume AS VARCHAR),
           dataset_hash
         FROM market_ohlcv
         WHERE symbol IN ({placeholders})
           AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
         ORDER BY symbol, timestamp"
    );
    let fundamentals_sql = format!(
        "SELECT COUNT(*) FROM company_fundamentals
         WHERE symbol IN ({placeholders}) AND published_at <= CAST(? AS TIMESTAMP)"
    );
    let actions_sql = format!(
        "SELECT COUNT(*) FROM corporate_actions
         WHERE symbol IN ({placeholders})
           AND CAST(effective_at AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)"
    );
    let ratings_sql = format!(
        "SELECT COUNT(*) FROM analyst_ratings
         WHERE symbol IN ({placeholders}) AND revised_at <= CAST(? AS TIMESTAMP)"
    );

    let mut range_bind: Vec<String> = universe.to_vec();
    range_bind.push(start_date.to_string());
    range_bind.push(end_date.to_string());
    let mut asof_bind: Vec<String> = universe.to_vec();
    asof_bind.push(format!("{}T23:59:59", end_date));

    let mut rows: Vec<Vec<String>> = Vec::new();
    let fundamentals_count: i64;
    let actions_count: i64;
    let ratings_count: i64;
    {
        let conn = analytics.conn();
        let mut stmt = conn.prepare(&rows_sql)?;
        let mapped = stmt.query_map(duckdb::params_from_iter(range_bind.iter()), |row| {
            let mut values = Vec::with_capacity(9);
            for idx in 0..9 {
                values.push(row.get::<_, String>(idx)?);
            }
            Ok(values)
        })?;
        for row in mapped {
            rows.push(row?);
        }
        fundamentals_count = conn.query_row(
            &fundamentals_sql,
            duckdb::params_from_iter(asof_bind.iter()),
            |row| row.get(0),
        )?;
        actions_count = conn.query_row(
            &actions_sql,
            duckdb::params_from_iter(range_bind.iter()),
            |row| row.get(0),
        )?;
        ratings_count = conn.query_row(
            &ratings_sql,
            duckdb::params_from_iter(asof_bind.iter()),
            |row| row.get(0),
        )?;
    }

    if rows.is_empty() {
        return Err(FinError::invalid(
            "no market rows available for requested universe/date range",
        ));
    }

    let mut by_symbol: std::collections::HashMap<&str, i64> =
        universe.iter().map(|s| (s.as_str(), 0)).collect();
    let mut hasher = Sha256::new();
    for row in &rows {
        if let Some(count) = by_symbol.get_mut(row[0].as_str()) {
            *count += 1;
        }
        hasher.update(row.join("|").as_bytes());
    }
    hasher.update(format!("adjustment_policy={}", policy).as_bytes());
    hasher.update(format!("fundamentals_count={}", fundamentals_count).as_bytes());
    hasher.update(format!("actions_count={}", actions_count).as_bytes());
    hasher.update(format!("ratings_count={}", ratings_count).as_bytes());

    let missing: Vec<&str> = universe
        .iter()
        .map(String::as_str)
        .filter(|symbol| by_symbol.get(symbol).copied().unwrap_or(0) == 0)
        .collect();
    if !missing.is_empty() {
        return Err(FinError::invalid(format!(
            "critical PIT data missing for symbols: {:?}",
            missing
        )));
    }

    let manifest = WorldStateManifest {
        manifest_id: Uuid::new_v4().to_string(),
        universe: universe.to_vec(),
        start_date: start_date.to_string(),
        end_date: end_date.to_string(),
        data_hash: hex::encode(hasher.finalize()),
        row_count: rows.len() as i64,
        fundamentals_row_count: fundamentals_count,
        corporate_actions_row_count: actions_count,
        ratings_row_count: ratings_count,
        adjustment_policy: policy,
    };
    state.save_world_manifest(&serde_json::to_value(&manifest)?)?;
    Ok(manifest)
}

/// Per-symbol instrument and feature coverage over the range.
pub fn build_data_completeness_report(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    strict_mode: bool,
) -> FinResult<DataCompletenessReport> {
    if universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }
    let placeholders = in_clause(universe);
    let ohlcv_sql = format!(
        "SELECT symbol, COUNT(*) FROM market_ohlcv
         WHERE symbol IN ({placeholders})
           AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
         GROUP BY symbol"
    );
    let technical_sql = format!(
        "SELECT symbol, COUNT(*) FROM market_technicals
         WHERE symbol IN ({placeholders})
           AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
         GROUP BY symbol"
    );
    let mut bind: Vec<String> = universe.to_vec();
    bind.push(start_date.to_string());
    bind.push(end_date.to_string());

    let mut ohlcv_counts = std::collections::HashMap::new();
    let mut technical_counts = std::collections::HashMap::new();
    {
        let conn = analytics.conn();
        for (sql, counts) in [
            (&ohlcv_sql, &mut ohlcv_counts),
            (&technical_sql, &mut technical_counts),
        ] {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(duckdb::params_from_iter(bind.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (symbol, count) = row?;
                counts.insert(symbol, count);
            }
        }
    }

    let mut skipped_instruments = Vec::new();
    let mut skipped_features = Vec::new();
    for symbol in universe {
        if ohlcv_counts.get(symbol).copied().unwrap_or(0) <= 0 {
            skipped_instruments.push(serde_json::json!({
                "symbol": symbol,
                "fallback_reason": "missing_ohlcv_rows",
            }));
            continue;
        }
        if technical_counts.get(symbol).copied().unwrap_or(0) <= 0 {
            skipped_features.push(serde_json::json!({
                "symbol": symbol,
                "feature": "sma_short,sma_long",
                "fallback_reason": "missing_technical_rows",
            }));
        }
    }

    let fallback_reason = if !skipped_instruments.is_empty() {
        Some("critical_missing_ohlcv_rows".to_string())
    } else if !skipped_features.is_empty() {
        Some("technical_features_missing".to_string())
    } else {
        None
    };

    if strict_mode && !skipped_instruments.is_empty() {
        return Err(FinError::invalid(
            "strict completeness check failed: missing critical PIT dependencies (OHLCV rows). \
             Remediation: import required OHLCV data for all requested symbols/date range.",
        ));
    }

    Ok(DataCompletenessReport {
        total_symbols: universe.len(),
        covered_symbols: universe.len() - skipped_instruments.len(),
        universe: universe.to_vec(),
        start_date: start_date.to_string(),
        end_date: end_date.to_string(),
        strict_mode,
        skipped_instruments,
        skipped_features,
        fallback_reason,
    })
}

/// Count future-publication leaks and null event times over the range.
pub fn validate_world_state_pit(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    strict_mode: bool,
) -> FinResult<PitValidationReport> {
    if universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }
    let placeholders = in_clause(universe);
    let sql = format!(
        "SELECT symbol, CAST(timestamp AS VARCHAR), CAST(published_at AS VARCHAR)
         FROM market_ohlcv
         WHERE symbol IN ({placeholders})
           AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)"
    );
    let mut bind: Vec<String> = universe.to_vec();
    bind.push(start_date.to_string());
    bind.push(end_date.to_string());

    let mut rows: Vec<(String, Option<String>, Option<String>)> = Vec::new();
    {
        let conn = analytics.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(duckdb::params_from_iter(bind.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in mapped {
            rows.push(row?);
        }
    }

    let mut errors = Vec::new();
    let mut remediation = Vec::new();
    if rows.is_empty() {
        errors.push("no market_ohlcv rows available for universe/date range".to_string());
        remediation.push("import OHLCV data for requested universe/date range".to_string());
    }

    let mut by_symbol: std::collections::HashMap<&str, i64> =
        universe.iter().map(|s| (s.as_str(), 0)).collect();
    let mut leak_rows = 0i64;
    let mut missing_published_at_rows = 0i64;
    for (symbol, timestamp, published_at) in &rows {
        if let Some(count) = by_symbol.get_mut(symbol.as_str()) {
            *count += 1;
        }
        match (timestamp, published_at) {
            (Some(ts), Some(pub_at)) => {
                // ISO timestamps compare correctly as strings.
                if pub_at > ts {
                    leak_rows += 1;
                }
            }
            _ => missing_published_at_rows += 1,
        }
    }

    let missing: Vec<&str> = universe
        .iter()
        .map(String::as_str)
        .filter(|symbol| by_symbol.get(symbol).copied().unwrap_or(0) == 0)
        .collect();
    if !missing.is_empty() {
        errors.push(format!("missing rows for symbols: {:?}", missing));
        remediation.push("import OHLCV rows for all requested symbols".to_string());
    }
    if missing_published_at_rows > 0 {
        errors.push(format!(
            "rows missing critical published_at/timestamp fields: {}",
            missing_published_at_rows
        ));
        remediation.push(
            "backfill market_ohlcv.published_at for all rows (published_at = timestamp)"
                .to_string(),
        );
    }
    if leak_rows > 0 {
        errors.push(format!(
            "future publication leaks detected: {} rows where published_at > timestamp",
            leak_rows
        ));
        remediation.push(
            "fix source publication timestamps and re-import; published_at must be <= timestamp for PIT safety"
                .to_string(),
        );
    }

    let valid = errors.is_empty();
    if strict_mode && !valid {
        return Err(FinError::invalid(format!(
            "PIT validation failed in strict mode: {}. Remediation: {}",
            errors.join("; "),
            remediation.join(" | ")
        )));
    }

    Ok(PitValidationReport {
        universe: universe.to_vec(),
        start_date: start_date.to_string(),
        end_date: end_date.to_string(),
        strict_mode,
        valid,
        errors,
        remediation,
        leak_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (AnalyticsStore, StateStore) {
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        analytics
            .conn()
            .execute_batch(
                "INSERT INTO market_ohlcv VALUES
                   ('2025-01-01', '2025-01-01', 'ABC', 1, 2, 0.5, 1.5, 100, 's.csv', 'h', '2025-01-01'),
                   ('2025-01-02', '2025-01-02', 'ABC', 1, 2, 0.5, 1.8, 110, 's.csv', 'h', '2025-01-02'),
                   ('2025-01-01', '2025-01-01', 'XYZ', 5, 6, 4.0, 5.0, 200, 's.csv', 'h', '2025-01-01');",
            )
            .unwrap();
        (analytics, state)
    }

    fn universe() -> Vec<String> {
        vec!["ABC".to_string(), "XYZ".to_string()]
    }

    #[test]
    fn test_manifest_hash_is_deterministic() {
        let (analytics, state) = seeded();
        let first = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "none",
        )
        .unwrap();
        let second = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "none",
        )
        .unwrap();
        assert_eq!(first.data_hash, second.data_hash);
        assert_eq!(first.row_count, 3);
        assert_ne!(first.manifest_id, second.manifest_id);
    }

    #[test]
    fn test_manifest_hash_covers_policy() {
        let (analytics, state) = seeded();
        let none = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "none",
        )
        .unwrap();
        let split = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "split_adjusted",
        )
        .unwrap();
        assert_ne!(none.data_hash, split.data_hash);
    }

    #[test]
    fn test_manifest_insertion_order_does_not_matter() {
        let (analytics, state) = seeded();
        let forward = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "none",
        )
        .unwrap();

        // Same data inserted in a different physical order.
        let (analytics2, state2) = {
            let analytics = AnalyticsStore::in_memory().unwrap();
            let state = StateStore::in_memory().unwrap();
            analytics
                .conn()
                .execute_batch(
                    "INSERT INTO market_ohlcv VALUES
                       ('2025-01-01', '2025-01-01', 'XYZ', 5, 6, 4.0, 5.0, 200, 's.csv', 'h', '2025-01-01'),
                       ('2025-01-02', '2025-01-02', 'ABC', 1, 2, 0.5, 1.8, 110, 's.csv', 'h', '2025-01-02'),
                       ('2025-01-01', '2025-01-01', 'ABC', 1, 2, 0.5, 1.5, 100, 's.csv', 'h', '2025-01-01');",
                )
                .unwrap();
            (analytics, state)
        };
        let reordered = build_world_state_manifest(
            &analytics2, &state2, &universe(), "2025-01-01", "2025-01-31", "none",
        )
        .unwrap();
        assert_eq!(forward.data_hash, reordered.data_hash);
    }

    #[test]
    fn test_manifest_rejects_missing_symbol() {
        let (analytics, state) = seeded();
        let err = build_world_state_manifest(
            &analytics,
            &state,
            &["ABC".to_string(), "GONE".to_string()],
            "2025-01-01",
            "2025-01-31",
            "none",
        )
        .unwrap_err();
        assert!(err.to_string().contains("GONE"));
    }

    #[test]
    fn test_manifest_rejects_unknown_policy() {
        let (analytics, state) = seeded();
        let err = build_world_state_manifest(
            &analytics, &state, &universe(), "2025-01-01", "2025-01-31", "dividend_magic",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported adjustment_policy"));
    }

    #[test]
    fn test_pit_validation_counts_leaks() {
        let (analytics, _state) = seeded();
        let clean =
            validate_world_state_pit(&analytics, &universe(), "2025-01-01", "2025-01-31", true)
                .unwrap();
        assert!(clean.valid);
        assert_eq!(clean.leak_rows, 0);

        analytics
            .admin_execute(
                "UPDATE market_ohlcv SET published_at = timestamp + INTERVAL 1 DAY WHERE symbol = 'ABC'",
            )
            .unwrap();
        let err =
            validate_world_state_pit(&analytics, &universe(), "2025-01-01", "2025-01-31", true)
                .unwrap_err();
        assert!(err.to_string().contains("future publication leaks detected"));

        let lax =
            validate_world_state_pit(&analytics, &universe(), "2025-01-01", "2025-01-31", false)
                .unwrap();
        assert!(!lax.valid);
        assert_eq!(lax.leak_rows, 2);
    }

    #[test]
    fn test_completeness_report_flags_missing_features() {
        let (analytics, _state) = seeded();
        let report = build_data_completeness_report(
            &analytics, &universe(), "2025-01-01", "2025-01-31", false,
        )
        .unwrap();
        assert_eq!(report.covered_symbols, 2);
        assert_eq!(report.fallback_reason.as_deref(), Some("technical_features_missing"));

        let report = build_data_completeness_report(
            &analytics,
            &["ABC".to_string(), "GONE".to_string()],
            "2025-01-01",
            "2025-01-31",
            false,
        )
        .unwrap();
        assert_eq!(report.fallback_reason.as_deref(), Some("critical_missing_ohlcv_rows"));
        assert!(build_data_completeness_report(
            &analytics,
            &["GONE".to_string()],
            "2025-01-01",
            "2025-01-31",
            true,
        )
        .is_err());
    }
}
