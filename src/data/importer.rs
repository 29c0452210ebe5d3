//! Point-in-time data importers.
//!
//! CSV/Parquet files are bulk-loaded into the analytics store through DuckDB
//! relations. Every import validates the schema up front, hashes the source
//! file, wraps the insert in pre/post row counts and appends an audit event.
//! Fundamentals, corporate actions and ratings forbid null event times; the
//! OHLCV importer copies `timestamp` into `published_at`.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{FinError, FinResult};
use crate::storage::{AnalyticsStore, StateStore};

const OHLCV_COLUMNS: &[&str] = &["timestamp", "symbol", "open", "high", "low", "close", "volume"];
const FUNDAMENTALS_COLUMNS: &[&str] = &["symbol", "published_at"];
const CORPORATE_ACTION_COLUMNS: &[&str] = &["symbol", "effective_at", "action_type"];
const RATINGS_COLUMNS: &[&str] = &["symbol", "revised_at", "agency", "rating"];

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ImportResult {
    pub source_path: String,
    pub rows_inserted: i64,
    pub dataset_hash: String,
}

fn hash_file(path: &Path) -> FinResult<String> {
    let mut handle = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = handle.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn ensure_supported_input(path: &Path) -> FinResult<()> {
    if !path.exists() {
        return Err(FinError::invalid(format!(
            "input file not found: {}",
            path.display()
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if ext != "csv" && ext != "parquet" {
        return Err(FinError::invalid("only .csv and .parquet are supported"));
    }
    Ok(())
}

fn relation_for_file(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "''");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if ext == "csv" {
        format!("read_csv_auto('{}', header=true)", escaped)
    } else {
        format!("read_parquet('{}')", escaped)
    }
}

fn csv_header_columns(path: &Path) -> FinResult<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| FinError::invalid(format!("failed to read csv header: {}", e)))?;
    let headers = reader
        .headers()
        .map_err(|e| FinError::invalid(format!("failed to read csv header: {}", e)))?;
    Ok(headers.iter().map(|h| h.to_string()).collect())
}

fn relation_columns(analytics: &AnalyticsStore, relation: &str) -> FinResult<Vec<String>> {
    let conn = analytics.conn();
    let mut stmt = conn.prepare(&format!("DESCRIBE SELECT * FROM {}", relation))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn validate_columns(
    analytics: &AnalyticsStore,
    path: &Path,
    relation: &str,
    required: &[&str],
) -> FinResult<()> {
    let present = if path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
    {
        csv_header_columns(path)?
    } else {
        relation_columns(analytics, relation)?
    };
    let missing: Vec<&str> = required
        .iter()
        .filter(|column| !present.iter().any(|p| p == *column))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(FinError::invalid(format!(
            "missing required columns: {:?}",
            missing
        )));
    }
    Ok(())
}

fn ensure_required_event_times(
    analytics: &AnalyticsStore,
    relation: &str,
    column: &str,
) -> FinResult<()> {
    let conn = analytics.conn();
    let missing: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {relation}
             WHERE {column} IS NULL OR TRIM(CAST({column} AS VARCHAR)) = ''"
        ),
        [],
        |row| row.get(0),
    )?;
    if missing > 0 {
        return Err(FinError::invalid(format!(
            "{column} is required for all rows; found {missing} rows missing {column}"
        )));
    }
    Ok(())
}

fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct ImportPlan<'a> {
    table: &'a str,
    insert_sql: String,
    audit_event: &'a str,
}

fn run_import(
    analytics: &AnalyticsStore,
    state: &StateStore,
    path: &Path,
    dataset_hash: &str,
    plan: ImportPlan<'_>,
) -> FinResult<ImportResult> {
    let before = analytics.count_table_rows(plan.table)?;
    let source_path = path.to_string_lossy().to_string();
    {
        let conn = analytics.conn();
        conn.execute(
            &plan.insert_sql,
            duckdb::params![source_path, dataset_hash, utc_now()],
        )?;
    }
    let after = analytics.count_table_rows(plan.table)?;
    let rows_inserted = after - before;
    if rows_inserted <= 0 {
        return Err(FinError::invalid(format!(
            "no rows inserted from {}",
            path.display()
        )));
    }

    state.append_audit_event(
        plan.audit_event,
        &json!({
            "source_path": path.to_string_lossy(),
            "rows_inserted": rows_inserted,
            "dataset_hash": dataset_hash,
        }),
    )?;
    Ok(ImportResult {
        source_path: path.to_string_lossy().to_string(),
        rows_inserted,
        dataset_hash: dataset_hash.to_string(),
    })
}

/// Import an OHLCV file. `published_at` is copied from `timestamp` (the only
/// importer where an absent publication time is tolerated).
pub fn import_ohlcv_file(
    analytics: &AnalyticsStore,
    state: &StateStore,
    path: &Path,
) -> FinResult<ImportResult> {
    let path: PathBuf = path.to_path_buf();
    ensure_supported_input(&path)?;
    let dataset_hash = hash_file(&path)?;
    let relation = relation_for_file(&path);
    validate_columns(analytics, &path, &relation, OHLCV_COLUMNS)?;

    let insert_sql = format!(
        "INSERT INTO market_ohlcv
           (timestamp, published_at, symbol, open, high, low, close, volume, source_file, dataset_hash, ingested_at)
         SELECT
           CAST(timestamp AS TIMESTAMP),
           CAST(timestamp AS TIMESTAMP),
           CAST(symbol AS VARCHAR),
           CAST(open AS DOUBLE),
           CAST(high AS DOUBLE),
           CAST(low AS DOUBLE),
           CAST(close AS DOUBLE),
           CAST(volume AS DOUBLE),
           ?, ?, CAST(? AS TIMESTAMP)
         FROM {relation}"
    );
    run_import(
        analytics,
        state,
        &path,
        &dataset_hash,
        ImportPlan {
            table: "market_ohlcv",
            insert_sql,
            audit_event: "data.import",
        },
    )
}

pub fn import_fundamentals_file(
    analytics: &AnalyticsStore,
    state: &StateStore,
    path: &Path,
) -> FinResult<ImportResult> {
    let path: PathBuf = path.to_path_buf();
    ensure_supported_input(&path)?;
    let dataset_hash = hash_file(&path)?;
    let relation = relation_for_file(&path);
    validate_columns(analytics, &path, &relation, FUNDAMENTALS_COLUMNS)?;
    ensure_required_event_times(analytics, &relation, "published_at")?;

    let insert_sql = format!(
        "INSERT INTO company_fundamentals
           (symbol, published_at, pe_ratio, eps, payload_json, source_file, dataset_hash, ingested_at)
         SELECT
           CAST(symbol AS VARCHAR),
           CAST(published_at AS TIMESTAMP),
           TRY_CAST(pe_ratio AS DOUBLE),
           TRY_CAST(eps AS DOUBLE),
           '{{}}',
           ?, ?, CAST(? AS TIMESTAMP)
         FROM {relation}"
    );
    run_import(
        analytics,
        state,
        &path,
        &dataset_hash,
        ImportPlan {
            table: "company_fundamentals",
            insert_sql,
            audit_event: "data.import.fundamentals",
        },
    )
}

pub fn import_corporate_actions_file(
    analytics: &AnalyticsStore,
    state: &StateStore,
    path: &Path,
) -> FinResult<ImportResult> {
    let path: PathBuf = path.to_path_buf();
    ensure_supported_input(&path)?;
    let dataset_hash = hash_file(&path)?;
    let relation = relation_for_file(&path);
    validate_columns(analytics, &path, &relation, CORPORATE_ACTION_COLUMNS)?;
    ensure_required_event_times(analytics, &relation, "effective_at")?;

    let insert_sql = format!(
        "INSERT INTO corporate_actions
           (symbol, effective_at, action_type, action_value, payload_json, source_file, dataset_hash, ingested_at)
         SELECT
           CAST(symbol AS VARCHAR),
           CAST(effective_at AS TIMESTAMP),
           CAST(action_type AS VARCHAR),
           TRY_CAST(action_value AS DOUBLE),
           '{{}}',
           ?, ?, CAST(? AS TIMESTAMP)
         FROM {relation}"
    );
    run_import(
        analytics,
        state,
        &path,
        &dataset_hash,
        ImportPlan {
            table: "corporate_actions",
            insert_sql,
            audit_event: "data.import.corporate_actions",
        },
    )
}

pub fn import_ratings_file(
    analytics: &AnalyticsStore,
    state: &StateStore,
    path: &Path,
) -> FinResult<ImportResult> {
    let path: PathBuf = path.to_path_buf();
    ensure_supported_input(&path)?;
    let dataset_hash = hash_file(&path)?;
    let relation = relation_for_file(&path);
    validate_columns(analytics, &path, &relation, RATINGS_COLUMNS)?;
    ensure_required_event_times(analytics, &relation, "revised_at")?;

    let insert_sql = format!(
        "INSERT INTO analyst_ratings
           (symbol, revised_at, agency, rating, payload_json, source_file, dataset_hash, ingested_at)
         SELECT
           CAST(symbol AS VARCHAR),
           CAST(revised_at AS TIMESTAMP),
           CAST(agency AS VARCHAR),
           CAST(rating AS VARCHAR),
           '{{}}',
           ?, ?, CAST(? AS TIMESTAMP)
         FROM {relation}"
    );
    run_import(
        analytics,
        state,
        &path,
        &dataset_hash,
        ImportPlan {
            table: "analyst_ratings",
            insert_sql,
            audit_event: "data.import.ratings",
        },
    )
}

/// Strict as-of fundamentals lookup (`published_at <= as_of`).
pub fn query_fundamentals_as_of(
    analytics: &AnalyticsStore,
    symbol: &str,
    as_of: &str,
) -> FinResult<serde_json::Value> {
    if symbol.trim().is_empty() {
        return Err(FinError::invalid("symbol is required"));
    }
    if as_of.trim().is_empty() {
        return Err(FinError::invalid("as_of is required"));
    }
    let conn = analytics.conn();
    let mut stmt = conn.prepare(
        "SELECT symbol, CAST(published_at AS VARCHAR), pe_ratio, eps
         FROM company_fundamentals
         WHERE symbol = ? AND published_at <= CAST(? AS TIMESTAMP)
         ORDER BY published_at DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query_map(duckdb::params![symbol, as_of], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<f64>>(3)?,
        ))
    })?;
    match rows.next() {
        Some(row) => {
            let (symbol, published_at, pe_ratio, eps) = row?;
            Ok(json!({
                "symbol": symbol,
                "published_at": published_at,
                "pe_ratio": pe_ratio,
                "eps": eps,
            }))
        }
        None => Err(FinError::not_found(format!(
            "no fundamentals row found for symbol={} as_of={}",
            symbol, as_of
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut handle = std::fs::File::create(&path).unwrap();
        handle.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_import_ohlcv_counts_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        let path = write_csv(
            dir.path(),
            "ohlcv.csv",
            "timestamp,symbol,open,high,low,close,volume\n\
             2025-01-01,ABC,1,2,0.5,1.5,100\n\
             2025-01-02,ABC,1.5,2.5,1.0,2.0,120\n",
        );
        let result = import_ohlcv_file(&analytics, &state, &path).unwrap();
        assert_eq!(result.rows_inserted, 2);
        assert_eq!(result.dataset_hash.len(), 64);
        // published_at mirrors timestamp for OHLCV imports.
        let leaks: i64 = analytics
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM market_ohlcv WHERE published_at != timestamp",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leaks, 0);
        let audits = state.list_audit_events(Some("data.import")).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0]["payload"]["rows_inserted"], 2);
    }

    #[test]
    fn test_import_rejects_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        let path = write_csv(dir.path(), "bad.csv", "timestamp,symbol,close\n2025-01-01,ABC,1.5\n");
        let err = import_ohlcv_file(&analytics, &state, &path).unwrap_err();
        assert!(err.to_string().contains("missing required columns"));
    }

    #[test]
    fn test_fundamentals_forbid_null_event_times() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        let path = write_csv(
            dir.path(),
            "fundamentals.csv",
            "symbol,published_at,pe_ratio,eps\nABC,,24.5,3.1\n",
        );
        let err = import_fundamentals_file(&analytics, &state, &path).unwrap_err();
        assert!(err.to_string().contains("published_at is required"));
    }

    #[test]
    fn test_fundamentals_as_of() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        let path = write_csv(
            dir.path(),
            "fundamentals.csv",
            "symbol,published_at,pe_ratio,eps\n\
             ABC,2025-01-01,20.0,2.0\n\
             ABC,2025-02-01,25.0,2.5\n",
        );
        import_fundamentals_file(&analytics, &state, &path).unwrap();
        let row = query_fundamentals_as_of(&analytics, "ABC", "2025-01-15").unwrap();
        assert_eq!(row["pe_ratio"], 20.0);
        let err = query_fundamentals_as_of(&analytics, "ABC", "2024-12-31").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        let path = write_csv(dir.path(), "data.txt", "timestamp,symbol\n");
        let err = import_ohlcv_file(&analytics, &state, &path).unwrap_err();
        assert!(err.to_string().contains("only .csv and .parquet"));
    }
}
