//! Relational state store.
//!
//! SQLite-backed durable state for strategies, versions, backtest runs,
//! tuning runs, live state, jobs, audit events, OAuth states, connector
//! sessions, session ledgers and the candle cache. This module is the only
//! writer of these tables.
//!
//! Every multi-row write happens inside a single transaction; uniqueness
//! invariants (version numbers, OAuth single-consume) are enforced with
//! `SELECT MAX`/guarded `UPDATE` statements inside those transactions.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{FinError, FinResult};
use crate::observability::get_trace_id;
use crate::security::{decrypt_payload, encrypt_payload, encryption_enabled, redact_payload};
use crate::storage::paths::RuntimePaths;

/// Reference to a freshly saved strategy version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StrategyVersionRef {
    pub strategy_id: String,
    pub strategy_version_id: String,
    pub version_number: i64,
}

pub struct StateStore {
    conn: Mutex<Connection>,
}

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

fn require_positive_limit(limit: i64) -> FinResult<i64> {
    if limit <= 0 {
        return Err(FinError::invalid("limit must be positive"));
    }
    Ok(limit)
}

fn require_nonempty(value: &str, label: &str) -> FinResult<()> {
    if value.trim().is_empty() {
        return Err(FinError::invalid(format!("{} is required", label)));
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> FinResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| FinError::internal(format!("unparseable stored timestamp: {}", raw)))
}

fn to_json(raw: &str) -> FinResult<Value> {
    serde_json::from_str(raw)
        .map_err(|e| FinError::internal(format!("corrupt stored json payload: {}", e)))
}

/// Cache key for a kite candle request: sha256 over the canonical (sorted-key)
/// JSON of the identifying 5-tuple.
pub fn kite_candle_cache_key(
    symbol: &str,
    instrument_token: &str,
    interval: &str,
    from_ts: &str,
    to_ts: &str,
) -> String {
    let canonical = json!({
        "from_ts": from_ts,
        "instrument_token": instrument_token,
        "interval": interval,
        "symbol": symbol,
        "to_ts": to_ts,
    });
    let encoded = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

impl StateStore {
    pub fn open(paths: &RuntimePaths) -> FinResult<Self> {
        paths.ensure()?;
        Self::open_path(paths.state_db_path())
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> FinResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> FinResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> FinResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS intent_snapshots (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategy_versions (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(strategy_id, version_number)
            );
            CREATE INDEX IF NOT EXISTS idx_strategy_versions_strategy
                ON strategy_versions(strategy_id, version_number DESC);

            CREATE TABLE IF NOT EXISTS world_manifests (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backtest_runs (
                id TEXT PRIMARY KEY,
                strategy_version_id TEXT NOT NULL,
                world_manifest_id TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                artifacts_json TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backtest_runs_version
                ON backtest_runs(strategy_version_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                result_json TEXT,
                error_text TEXT,
                fallback_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                connector TEXT NOT NULL,
                created_at TEXT NOT NULL,
                consumed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_states_connector
                ON oauth_states(connector, state);

            CREATE TABLE IF NOT EXISTS connector_sessions (
                connector TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS code_strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS code_strategy_versions (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                source_code TEXT NOT NULL,
                validation_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(strategy_id, version_number)
            );

            CREATE TABLE IF NOT EXISTS tuning_runs (
                id TEXT PRIMARY KEY,
                strategy_name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tuning_trials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tuning_run_id TEXT NOT NULL,
                backtest_run_id TEXT NOT NULL,
                params_json TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                score REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tuning_trials_run
                ON tuning_trials(tuning_run_id);

            CREATE TABLE IF NOT EXISTS tuning_layer_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tuning_run_id TEXT NOT NULL,
                layer_name TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                reason TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tuning_layers_run
                ON tuning_layer_decisions(tuning_run_id);

            CREATE TABLE IF NOT EXISTS live_states (
                strategy_version_id TEXT PRIMARY KEY,
                strategy_name TEXT NOT NULL,
                status TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS live_insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_version_id TEXT NOT NULL,
                action TEXT NOT NULL,
                symbol TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                score REAL NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tax_reports (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tool_context_deltas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                input_json TEXT NOT NULL,
                output_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_context_deltas_session
                ON tool_context_deltas(session_id, id);

            CREATE TABLE IF NOT EXISTS session_state_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_snapshots_session
                ON session_state_snapshots(session_id, id);

            CREATE TABLE IF NOT EXISTS kite_candle_cache (
                cache_key TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                instrument_token TEXT NOT NULL,
                interval TEXT NOT NULL,
                from_ts TEXT NOT NULL,
                to_ts TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                dataset_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Intent snapshots
    // ------------------------------------------------------------------

    pub fn save_intent_snapshot(&self, payload: &Value) -> FinResult<String> {
        let snapshot_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO intent_snapshots (id, payload_json, created_at) VALUES (?1, ?2, ?3)",
            params![snapshot_id, payload.to_string(), utc_now()],
        )?;
        Ok(snapshot_id)
    }

    pub fn get_intent_snapshot(&self, snapshot_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM intent_snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => to_json(&raw),
            None => Err(FinError::not_found(format!(
                "intent_snapshot not found: {}",
                snapshot_id
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Classic strategies and versions
    // ------------------------------------------------------------------

    /// Upsert the strategy row (deterministic id supplied in the spec) and
    /// insert the next version, all in one transaction.
    pub fn save_strategy_version(
        &self,
        strategy_name: &str,
        spec: &Value,
    ) -> FinResult<StrategyVersionRef> {
        let strategy_id = spec
            .get("strategy_id")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FinError::invalid("strategy_id missing from StrategySpec"))?
            .to_string();

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO strategies (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![strategy_id, strategy_name, utc_now()],
        )?;
        let max_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM strategy_versions WHERE strategy_id = ?1",
            params![strategy_id],
            |row| row.get(0),
        )?;
        let next_version = max_version + 1;
        let version_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO strategy_versions (id, strategy_id, version_number, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![version_id, strategy_id, next_version, spec.to_string(), utc_now()],
        )?;
        tx.commit()?;
        Ok(StrategyVersionRef {
            strategy_id,
            strategy_version_id: version_id,
            version_number: next_version,
        })
    }

    pub fn get_latest_strategy_spec(&self, strategy_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM strategy_versions
                 WHERE strategy_id = ?1 ORDER BY version_number DESC LIMIT 1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => to_json(&raw),
            None => Err(FinError::not_found(format!(
                "strategy_id not found: {}",
                strategy_id
            ))),
        }
    }

    pub fn get_strategy_version(&self, strategy_version_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let row: Option<(String, String, i64, String, String)> = conn
            .query_row(
                "SELECT id, strategy_id, version_number, payload_json, created_at
                 FROM strategy_versions WHERE id = ?1",
                params![strategy_version_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, strategy_id, version_number, payload_json, created_at)) = row else {
            return Err(FinError::not_found(format!(
                "strategy_version_id not found: {}",
                strategy_version_id
            )));
        };
        Ok(json!({
            "strategy_version_id": id,
            "strategy_id": strategy_id,
            "version_number": version_number,
            "spec": to_json(&payload_json)?,
            "created_at": created_at,
        }))
    }

    pub fn list_strategies(&self, limit: i64) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        self.list_strategy_summaries("strategies", "strategy_versions", limit)
    }

    pub fn list_code_strategies(&self, limit: i64) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        self.list_strategy_summaries("code_strategies", "code_strategy_versions", limit)
    }

    fn list_strategy_summaries(
        &self,
        strategy_table: &str,
        version_table: &str,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT
               s.id, s.name, s.created_at,
               sv.id, sv.version_number, sv.created_at
             FROM {strategy_table} s
             LEFT JOIN {version_table} sv
               ON sv.id = (
                 SELECT inner_sv.id FROM {version_table} inner_sv
                 WHERE inner_sv.strategy_id = s.id
                 ORDER BY inner_sv.version_number DESC LIMIT 1
               )
             ORDER BY s.created_at DESC
             LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, created_at, latest_id, latest_version, latest_created_at) = row?;
            out.push(json!({
                "strategy_id": id,
                "strategy_name": name,
                "created_at": created_at,
                "latest_strategy_version_id": latest_id,
                "latest_version_number": latest_version,
                "latest_created_at": latest_created_at,
            }));
        }
        Ok(out)
    }

    pub fn list_strategy_versions(&self, strategy_id: &str, limit: i64) -> FinResult<Vec<Value>> {
        require_nonempty(strategy_id, "strategy_id")?;
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, version_number, payload_json, created_at
             FROM strategy_versions WHERE strategy_id = ?1
             ORDER BY version_number DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![strategy_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, strategy_id, version_number, payload_json, created_at) = row?;
            out.push(json!({
                "strategy_version_id": id,
                "strategy_id": strategy_id,
                "version_number": version_number,
                "spec": to_json(&payload_json)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Code strategies
    // ------------------------------------------------------------------

    /// Upsert the code strategy by name and append the next version in one
    /// transaction.
    pub fn save_code_strategy_version(
        &self,
        strategy_name: &str,
        source_code: &str,
        validation: &Value,
    ) -> FinResult<StrategyVersionRef> {
        require_nonempty(strategy_name, "strategy_name")?;
        require_nonempty(source_code, "source_code")?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM code_strategies WHERE name = ?1",
                params![strategy_name],
                |row| row.get(0),
            )
            .optional()?;
        let strategy_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO code_strategies (id, name, created_at) VALUES (?1, ?2, ?3)",
                    params![id, strategy_name, utc_now()],
                )?;
                id
            }
        };
        let max_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM code_strategy_versions WHERE strategy_id = ?1",
            params![strategy_id],
            |row| row.get(0),
        )?;
        let version_number = max_version + 1;
        let version_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO code_strategy_versions
               (id, strategy_id, version_number, source_code, validation_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version_id,
                strategy_id,
                version_number,
                source_code,
                validation.to_string(),
                utc_now()
            ],
        )?;
        tx.commit()?;
        Ok(StrategyVersionRef {
            strategy_id,
            strategy_version_id: version_id,
            version_number,
        })
    }

    pub fn list_code_strategy_versions(
        &self,
        strategy_id: &str,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        require_nonempty(strategy_id, "strategy_id")?;
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, version_number, source_code, validation_json, created_at
             FROM code_strategy_versions WHERE strategy_id = ?1
             ORDER BY version_number DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![strategy_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, strategy_id, version_number, source_code, validation_json, created_at) = row?;
            out.push(json!({
                "strategy_version_id": id,
                "strategy_id": strategy_id,
                "version_number": version_number,
                "source_code": source_code,
                "validation": to_json(&validation_json)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    pub fn get_code_strategy_version(&self, strategy_version_id: &str) -> FinResult<Value> {
        require_nonempty(strategy_version_id, "strategy_version_id")?;
        let conn = self.conn.lock();
        let row: Option<(String, String, i64, String, String, String, String)> = conn
            .query_row(
                "SELECT
                   sv.id, sv.strategy_id, sv.version_number, sv.source_code,
                   sv.validation_json, sv.created_at, s.name
                 FROM code_strategy_versions sv
                 INNER JOIN code_strategies s ON s.id = sv.strategy_id
                 WHERE sv.id = ?1",
                params![strategy_version_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, strategy_id, version_number, source_code, validation_json, created_at, name)) =
            row
        else {
            return Err(FinError::not_found(format!(
                "code_strategy_version not found: {}",
                strategy_version_id
            )));
        };
        Ok(json!({
            "strategy_version_id": id,
            "strategy_id": strategy_id,
            "strategy_name": name,
            "version_number": version_number,
            "source_code": source_code,
            "validation": to_json(&validation_json)?,
            "created_at": created_at,
        }))
    }

    // ------------------------------------------------------------------
    // World manifests and backtest runs
    // ------------------------------------------------------------------

    pub fn save_world_manifest(&self, manifest: &Value) -> FinResult<String> {
        let manifest_id = manifest
            .get("manifest_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO world_manifests (id, payload_json, created_at) VALUES (?1, ?2, ?3)",
            params![manifest_id, manifest.to_string(), utc_now()],
        )?;
        Ok(manifest_id)
    }

    pub fn save_backtest_run(
        &self,
        strategy_version_id: &str,
        world_manifest_id: &str,
        metrics: &Value,
        artifacts: &Value,
        payload: &Value,
    ) -> FinResult<String> {
        let run_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_runs
               (id, strategy_version_id, world_manifest_id, metrics_json, artifacts_json, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                strategy_version_id,
                world_manifest_id,
                metrics.to_string(),
                artifacts.to_string(),
                payload.to_string(),
                utc_now()
            ],
        )?;
        Ok(run_id)
    }

    pub fn get_backtest_run(&self, run_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String, String, String, String, String)> = conn
            .query_row(
                "SELECT id, strategy_version_id, world_manifest_id, metrics_json,
                        artifacts_json, payload_json, created_at
                 FROM backtest_runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, version_id, manifest_id, metrics, artifacts, payload, created_at)) = row
        else {
            return Err(FinError::not_found(format!(
                "backtest_run not found: {}",
                run_id
            )));
        };
        Ok(json!({
            "run_id": id,
            "strategy_version_id": version_id,
            "world_manifest_id": manifest_id,
            "metrics": to_json(&metrics)?,
            "artifacts": to_json(&artifacts)?,
            "payload": to_json(&payload)?,
            "created_at": created_at,
        }))
    }

    pub fn list_backtest_runs(
        &self,
        strategy_version_id: Option<&str>,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let mut push_row =
            |id: String,
             version_id: String,
             manifest_id: String,
             metrics: String,
             artifacts: String,
             payload: String,
             created_at: String|
             -> FinResult<()> {
                let run_payload = to_json(&payload)?;
                let strategy_name = run_payload
                    .get("strategy")
                    .and_then(|s| s.get("strategy_name"))
                    .and_then(Value::as_str)
                    .or_else(|| run_payload.get("strategy_name").and_then(Value::as_str))
                    .map(|s| s.to_string());
                out.push(json!({
                    "run_id": id,
                    "strategy_version_id": version_id,
                    "world_manifest_id": manifest_id,
                    "strategy_name": strategy_name,
                    "metrics": to_json(&metrics)?,
                    "artifacts": to_json(&artifacts)?,
                    "payload": run_payload,
                    "created_at": created_at,
                }));
                Ok(())
            };

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        };
        let select =
            "SELECT id, strategy_version_id, world_manifest_id, metrics_json, artifacts_json, payload_json, created_at
             FROM backtest_runs";
        if let Some(version_id) = strategy_version_id {
            let mut stmt = conn.prepare(&format!(
                "{select} WHERE strategy_version_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![version_id, limit], map_row)?;
            for row in rows {
                let (a, b, c, d, e, f, g) = row?;
                push_row(a, b, c, d, e, f, g)?;
            }
        } else {
            let mut stmt =
                conn.prepare(&format!("{select} ORDER BY created_at DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit], map_row)?;
            for row in rows {
                let (a, b, c, d, e, f, g) = row?;
                push_row(a, b, c, d, e, f, g)?;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Tuning runs, trials, layer decisions
    // ------------------------------------------------------------------

    /// Persist a tuning run plus its derived child rows in one transaction.
    /// A malformed trial or layer decision fails the whole save.
    pub fn save_tuning_run(&self, strategy_name: &str, payload: &Value) -> FinResult<String> {
        require_nonempty(strategy_name, "strategy_name")?;
        let run_id = payload
            .get("tuning_run_id")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO tuning_runs (id, strategy_name, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, strategy_name, payload.to_string(), utc_now()],
        )?;

        if let Some(evaluated) = payload.get("evaluated_candidates") {
            let rows = evaluated.as_array().ok_or_else(|| {
                FinError::invalid("tuning payload evaluated_candidates must be a list when provided")
            })?;
            for row in rows {
                let (backtest_run_id, params_json, metrics_json, score) =
                    validate_trial_row(row)?;
                tx.execute(
                    "INSERT INTO tuning_trials
                       (tuning_run_id, backtest_run_id, params_json, metrics_json, score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![run_id, backtest_run_id, params_json, metrics_json, score, utc_now()],
                )?;
            }
        }

        if let Some(plan) = payload.get("tuning_plan") {
            let plan = plan
                .as_object()
                .ok_or_else(|| FinError::invalid("tuning payload tuning_plan must be object when provided"))?;
            if let Some(layers) = plan.get("layers") {
                let layers = layers.as_array().ok_or_else(|| {
                    FinError::invalid("tuning payload tuning_plan.layers must be list when provided")
                })?;
                for layer in layers {
                    let (layer_name, enabled, reason) = validate_layer_row(layer)?;
                    tx.execute(
                        "INSERT INTO tuning_layer_decisions
                           (tuning_run_id, layer_name, enabled, reason, payload_json, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            run_id,
                            layer_name,
                            if enabled { 1 } else { 0 },
                            reason,
                            layer.to_string(),
                            utc_now()
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(run_id)
    }

    /// Deep-merge `updates` into the stored payload inside one transaction.
    pub fn update_tuning_run(&self, tuning_run_id: &str, updates: &Value) -> FinResult<()> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        let updates_map = updates
            .as_object()
            .ok_or_else(|| FinError::invalid("tuning run updates must be an object"))?;
        if updates_map.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT payload_json FROM tuning_runs WHERE id = ?1",
                params![tuning_run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(FinError::not_found(format!(
                "tuning_run not found: {}",
                tuning_run_id
            )));
        };
        let mut payload = to_json(&raw)?;
        deep_merge(&mut payload, updates);
        tx.execute(
            "UPDATE tuning_runs SET payload_json = ?1 WHERE id = ?2",
            params![payload.to_string(), tuning_run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn append_tuning_trial(
        &self,
        tuning_run_id: &str,
        backtest_run_id: &str,
        trial_params: &Value,
        metrics: &Value,
        score: f64,
    ) -> FinResult<()> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        require_nonempty(backtest_run_id, "backtest_run_id")?;
        if !trial_params.is_object() {
            return Err(FinError::invalid("tuning trial params must be an object"));
        }
        if !metrics.is_object() {
            return Err(FinError::invalid("tuning trial metrics must be an object"));
        }
        if !score.is_finite() {
            return Err(FinError::invalid("tuning trial score must be numeric"));
        }
        self.get_tuning_run(tuning_run_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tuning_trials
               (tuning_run_id, backtest_run_id, params_json, metrics_json, score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tuning_run_id,
                backtest_run_id,
                trial_params.to_string(),
                metrics.to_string(),
                score,
                utc_now()
            ],
        )?;
        Ok(())
    }

    pub fn append_tuning_layer_decision(
        &self,
        tuning_run_id: &str,
        layer_name: &str,
        enabled: bool,
        reason: &str,
        payload: &Value,
    ) -> FinResult<()> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        require_nonempty(layer_name, "layer_name")?;
        require_nonempty(reason, "reason")?;
        if !payload.is_object() {
            return Err(FinError::invalid("tuning layer payload must be an object"));
        }
        self.get_tuning_run(tuning_run_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tuning_layer_decisions
               (tuning_run_id, layer_name, enabled, reason, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tuning_run_id,
                layer_name,
                if enabled { 1 } else { 0 },
                reason,
                payload.to_string(),
                utc_now()
            ],
        )?;
        Ok(())
    }

    pub fn list_tuning_trials(&self, tuning_run_id: &str) -> FinResult<Vec<Value>> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tuning_run_id, backtest_run_id, params_json, metrics_json, score, created_at
             FROM tuning_trials WHERE tuning_run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![tuning_run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, run_id, backtest_run_id, params_json, metrics_json, score, created_at) = row?;
            out.push(json!({
                "id": id,
                "tuning_run_id": run_id,
                "backtest_run_id": backtest_run_id,
                "params": to_json(&params_json)?,
                "metrics": to_json(&metrics_json)?,
                "score": score,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    pub fn list_tuning_layer_decisions(&self, tuning_run_id: &str) -> FinResult<Vec<Value>> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tuning_run_id, layer_name, enabled, reason, payload_json, created_at
             FROM tuning_layer_decisions WHERE tuning_run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![tuning_run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, run_id, layer_name, enabled, reason, payload_json, created_at) = row?;
            out.push(json!({
                "id": id,
                "tuning_run_id": run_id,
                "layer_name": layer_name,
                "enabled": enabled != 0,
                "reason": reason,
                "payload": to_json(&payload_json)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    pub fn list_tuning_runs(
        &self,
        strategy_name: Option<&str>,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        };
        let mut push_row = |id: String, name: String, raw: String, created_at: String| -> FinResult<()> {
            let payload = to_json(&raw)?;
            let best = payload.get("best_candidate").cloned().unwrap_or(Value::Null);
            let candidate_count = payload
                .get("evaluated_candidates")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            out.push(json!({
                "tuning_run_id": id,
                "strategy_name": name,
                "best_score": best.get("score").cloned().unwrap_or(Value::Null),
                "best_backtest_run_id": best.get("run_id").cloned().unwrap_or(Value::Null),
                "candidate_count": candidate_count,
                "payload": payload,
                "created_at": created_at,
            }));
            Ok(())
        };
        if let Some(name) = strategy_name {
            let mut stmt = conn.prepare(
                "SELECT id, strategy_name, payload_json, created_at FROM tuning_runs
                 WHERE strategy_name = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![name, limit], map_row)?;
            for row in rows {
                let (a, b, c, d) = row?;
                push_row(a, b, c, d)?;
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, strategy_name, payload_json, created_at FROM tuning_runs
                 ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], map_row)?;
            for row in rows {
                let (a, b, c, d) = row?;
                push_row(a, b, c, d)?;
            }
        }
        Ok(out)
    }

    pub fn get_tuning_run(&self, tuning_run_id: &str) -> FinResult<Value> {
        require_nonempty(tuning_run_id, "tuning_run_id")?;
        let conn = self.conn.lock();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT id, strategy_name, payload_json, created_at FROM tuning_runs WHERE id = ?1",
                params![tuning_run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((id, name, raw, created_at)) = row else {
            return Err(FinError::not_found(format!(
                "tuning_run not found: {}",
                tuning_run_id
            )));
        };
        Ok(json!({
            "tuning_run_id": id,
            "strategy_name": name,
            "payload": to_json(&raw)?,
            "created_at": created_at,
        }))
    }

    // ------------------------------------------------------------------
    // Live state and insights
    // ------------------------------------------------------------------

    pub fn upsert_live_state(
        &self,
        strategy_version_id: &str,
        strategy_name: &str,
        status: &str,
        payload: &Value,
    ) -> FinResult<()> {
        if !matches!(status, "active" | "paused" | "stopped") {
            return Err(FinError::invalid(
                "status must be one of: active, paused, stopped",
            ));
        }
        let now = utc_now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO live_states
               (strategy_version_id, strategy_name, status, payload_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(strategy_version_id) DO UPDATE SET
               strategy_name = excluded.strategy_name,
               status = excluded.status,
               payload_json = excluded.payload_json,
               updated_at = excluded.updated_at",
            params![strategy_version_id, strategy_name, status, payload.to_string(), now, now],
        )?;
        Ok(())
    }

    pub fn get_live_state(&self, strategy_version_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String, String, String, String)> = conn
            .query_row(
                "SELECT strategy_version_id, strategy_name, status, payload_json, created_at, updated_at
                 FROM live_states WHERE strategy_version_id = ?1",
                params![strategy_version_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, name, status, payload, created_at, updated_at)) = row else {
            return Err(FinError::not_found(format!(
                "live_state not found for strategy_version_id={}",
                strategy_version_id
            )));
        };
        Ok(json!({
            "strategy_version_id": id,
            "strategy_name": name,
            "status": status,
            "payload": to_json(&payload)?,
            "created_at": created_at,
            "updated_at": updated_at,
        }))
    }

    pub fn list_live_states(&self, status: Option<&str>, limit: i64) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        };
        let select = "SELECT strategy_version_id, strategy_name, status, payload_json, created_at, updated_at FROM live_states";
        let mut out = Vec::new();
        let mut push_row = |row: (String, String, String, String, String, String)| -> FinResult<()> {
            let (id, name, status, payload, created_at, updated_at) = row;
            out.push(json!({
                "strategy_version_id": id,
                "strategy_name": name,
                "status": status,
                "payload": to_json(&payload)?,
                "created_at": created_at,
                "updated_at": updated_at,
            }));
            Ok(())
        };
        if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "{select} WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![status, limit], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        } else {
            let mut stmt =
                conn.prepare(&format!("{select} ORDER BY updated_at DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        }
        Ok(out)
    }

    pub fn append_live_insight(
        &self,
        strategy_version_id: &str,
        action: &str,
        symbol: &str,
        reason_code: &str,
        score: f64,
        payload: &Value,
    ) -> FinResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO live_insights
               (strategy_version_id, action, symbol, reason_code, score, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                strategy_version_id,
                action,
                symbol,
                reason_code,
                score,
                payload.to_string(),
                utc_now()
            ],
        )?;
        Ok(())
    }

    pub fn list_live_insights(
        &self,
        strategy_version_id: Option<&str>,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        };
        let select = "SELECT id, strategy_version_id, action, symbol, reason_code, score, payload_json, created_at FROM live_insights";
        let mut out = Vec::new();
        let mut push_row =
            |row: (i64, String, String, String, String, f64, String, String)| -> FinResult<()> {
                let (id, version_id, action, symbol, reason_code, score, payload, created_at) = row;
                out.push(json!({
                    "id": id,
                    "strategy_version_id": version_id,
                    "action": action,
                    "symbol": symbol,
                    "reason_code": reason_code,
                    "score": score,
                    "payload": to_json(&payload)?,
                    "created_at": created_at,
                }));
                Ok(())
            };
        if let Some(version_id) = strategy_version_id {
            let mut stmt = conn.prepare(&format!(
                "{select} WHERE strategy_version_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![version_id, limit], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        } else {
            let mut stmt = conn.prepare(&format!("{select} ORDER BY id DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Jobs and job events
    // ------------------------------------------------------------------

    pub fn create_job(&self, job_type: &str, payload: &Value) -> FinResult<String> {
        let job_id = Uuid::new_v4().to_string();
        let now = utc_now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs
               (id, job_type, status, payload_json, result_json, error_text, fallback_reason, created_at, updated_at)
             VALUES (?1, ?2, 'queued', ?3, NULL, NULL, NULL, ?4, ?5)",
            params![job_id, job_type, payload.to_string(), now, now],
        )?;
        Ok(job_id)
    }

    /// Update a job's status. Terminal statuses are sticky: once a job is
    /// `completed` or `failed`, only a repeat of the same status is accepted
    /// (and ignored), keeping terminal updates idempotent.
    pub fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        result: Option<&Value>,
        error_text: Option<&str>,
        fallback_reason: Option<&str>,
    ) -> FinResult<()> {
        if !matches!(status, "queued" | "running" | "completed" | "failed") {
            return Err(FinError::invalid(
                "status must be one of: queued, running, completed, failed",
            ));
        }
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(FinError::not_found(format!("job not found: {}", job_id)));
        };
        if matches!(current.as_str(), "completed" | "failed") {
            if current == status {
                return Ok(());
            }
            return Err(FinError::conflict(format!(
                "job {} already terminal with status={}",
                job_id, current
            )));
        }
        conn.execute(
            "UPDATE jobs
             SET status = ?1, result_json = ?2, error_text = ?3, fallback_reason = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                status,
                result.map(|r| r.to_string()),
                error_text,
                fallback_reason,
                utc_now(),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> FinResult<Value> {
        let conn = self.conn.lock();
        let row: Option<(
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
        )> = conn
            .query_row(
                "SELECT id, job_type, status, payload_json, result_json, error_text,
                        fallback_reason, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, job_type, status, payload, result, error_text, fallback, created, updated)) =
            row
        else {
            return Err(FinError::not_found(format!("job not found: {}", job_id)));
        };
        Ok(json!({
            "id": id,
            "job_type": job_type,
            "status": status,
            "payload": to_json(&payload)?,
            "result": match result { Some(raw) => to_json(&raw)?, None => Value::Null },
            "error_text": error_text,
            "fallback_reason": fallback,
            "created_at": created,
            "updated_at": updated,
        }))
    }

    pub fn append_job_event(&self, job_id: &str, event_type: &str, payload: &Value) -> FinResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job_events (job_id, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, event_type, payload.to_string(), utc_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rows strictly after the cursor, in ascending id order.
    pub fn list_job_events_after(&self, last_id: i64) -> FinResult<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, payload_json, created_at
             FROM job_events WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![last_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, job_id, event_type, payload, created_at) = row?;
            out.push(json!({
                "id": id,
                "job_id": job_id,
                "event_type": event_type,
                "payload": to_json(&payload)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Audit events
    // ------------------------------------------------------------------

    /// Append an audit event. The payload is redacted and the ambient
    /// trace id is merged in before the write.
    pub fn append_audit_event(&self, event_type: &str, payload: &Value) -> FinResult<i64> {
        let mut merged = redact_payload(payload);
        if let Value::Object(map) = &mut merged {
            map.entry("trace_id".to_string())
                .or_insert_with(|| Value::String(get_trace_id()));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_events (event_type, payload_json, created_at) VALUES (?1, ?2, ?3)",
            params![event_type, merged.to_string(), utc_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_audit_events(&self, event_type: Option<&str>) -> FinResult<Vec<Value>> {
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        };
        let mut out = Vec::new();
        let mut push_row = |row: (i64, String, String, String)| -> FinResult<()> {
            let (id, event_type, payload, created_at) = row;
            out.push(json!({
                "id": id,
                "event_type": event_type,
                "payload": to_json(&payload)?,
                "created_at": created_at,
            }));
            Ok(())
        };
        if let Some(event_type) = event_type {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, payload_json, created_at FROM audit_events
                 WHERE event_type = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![event_type], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, payload_json, created_at FROM audit_events ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], map_row)?;
            for row in rows {
                push_row(row?)?;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // OAuth state lifecycle
    // ------------------------------------------------------------------

    pub fn create_oauth_state(&self, connector: &str, state: &str) -> FinResult<()> {
        require_nonempty(connector, "connector")?;
        require_nonempty(state, "state")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO oauth_states (state, connector, created_at, consumed_at)
             VALUES (?1, ?2, ?3, NULL)",
            params![state, connector, utc_now()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                FinError::conflict(format!("oauth state already exists: {}", state))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Consume a specific state at most once. The guarded UPDATE inside the
    /// transaction is the authoritative single-consume check.
    pub fn consume_oauth_state(
        &self,
        connector: &str,
        state: &str,
        max_age_seconds: i64,
    ) -> FinResult<()> {
        require_nonempty(connector, "connector")?;
        require_nonempty(state, "state")?;
        if max_age_seconds <= 0 {
            return Err(FinError::invalid("max_age_seconds must be positive"));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT created_at, consumed_at FROM oauth_states
                 WHERE connector = ?1 AND state = ?2",
                params![connector, state],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((created_at, consumed_at)) = row else {
            return Err(FinError::not_found(format!(
                "oauth state not found for connector={}",
                connector
            )));
        };
        if consumed_at.is_some() {
            return Err(FinError::conflict(format!(
                "oauth state already consumed for connector={}",
                connector
            )));
        }
        let age = Utc::now() - parse_timestamp(&created_at)?;
        if age.num_seconds() > max_age_seconds {
            return Err(FinError::invalid(format!(
                "oauth state expired for connector={} age_seconds={}",
                connector,
                age.num_seconds()
            )));
        }
        let changed = tx.execute(
            "UPDATE oauth_states SET consumed_at = ?1
             WHERE connector = ?2 AND state = ?3 AND consumed_at IS NULL",
            params![utc_now(), connector, state],
        )?;
        if changed != 1 {
            return Err(FinError::conflict(format!(
                "failed to consume oauth state for connector={}",
                connector
            )));
        }
        tx.commit()?;
        Ok(())
    }

    /// Consume the single pending state for a connector; zero or multiple
    /// pending states are errors.
    pub fn consume_latest_oauth_state(
        &self,
        connector: &str,
        max_age_seconds: i64,
    ) -> FinResult<String> {
        require_nonempty(connector, "connector")?;
        if max_age_seconds <= 0 {
            return Err(FinError::invalid("max_age_seconds must be positive"));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut pending: Vec<(String, String)> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT state, created_at FROM oauth_states
                 WHERE connector = ?1 AND consumed_at IS NULL
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![connector], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                pending.push(row?);
            }
        }
        if pending.is_empty() {
            return Err(FinError::not_found(format!(
                "no pending oauth state for connector={}; generate a fresh connect_url",
                connector
            )));
        }
        if pending.len() > 1 {
            return Err(FinError::conflict(format!(
                "multiple pending oauth states for connector={}; generate a fresh connect_url and retry once",
                connector
            )));
        }
        let (state, created_at) = pending.remove(0);
        let age = Utc::now() - parse_timestamp(&created_at)?;
        if age.num_seconds() > max_age_seconds {
            return Err(FinError::invalid(format!(
                "latest oauth state expired for connector={} age_seconds={}",
                connector,
                age.num_seconds()
            )));
        }
        let changed = tx.execute(
            "UPDATE oauth_states SET consumed_at = ?1
             WHERE connector = ?2 AND state = ?3 AND consumed_at IS NULL",
            params![utc_now(), connector, state],
        )?;
        if changed != 1 {
            return Err(FinError::conflict(format!(
                "failed to consume latest oauth state for connector={}",
                connector
            )));
        }
        tx.commit()?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Connector sessions (encrypted at rest)
    // ------------------------------------------------------------------

    pub fn upsert_connector_session(&self, connector: &str, payload: &Value) -> FinResult<()> {
        require_nonempty(connector, "connector")?;
        let now = utc_now();
        let mut serialized = payload.to_string();
        if encryption_enabled() {
            serialized = encrypt_payload(&serialized)?;
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connector_sessions (connector, payload_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(connector) DO UPDATE SET
               payload_json = excluded.payload_json,
               updated_at = excluded.updated_at",
            params![connector, serialized, now, now],
        )?;
        Ok(())
    }

    pub fn get_connector_session(&self, connector: &str) -> FinResult<Option<Value>> {
        require_nonempty(connector, "connector")?;
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM connector_sessions WHERE connector = ?1",
                params![connector],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let plain = decrypt_payload(&raw)?;
        Ok(Some(to_json(&plain)?))
    }

    // ------------------------------------------------------------------
    // Tax reports (storage only; computation is an external collaborator)
    // ------------------------------------------------------------------

    pub fn save_tax_report(&self, run_id: &str, payload: &Value) -> FinResult<String> {
        let report_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tax_reports (id, run_id, payload_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![report_id, run_id, payload.to_string(), utc_now()],
        )?;
        Ok(report_id)
    }

    // ------------------------------------------------------------------
    // Session ledger
    // ------------------------------------------------------------------

    pub fn append_tool_context_delta(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &Value,
        tool_output: &Value,
    ) -> FinResult<i64> {
        require_nonempty(session_id, "session_id")?;
        require_nonempty(tool_name, "tool_name")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tool_context_deltas (session_id, tool_name, input_json, output_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                tool_name,
                redact_payload(tool_input).to_string(),
                redact_payload(tool_output).to_string(),
                utc_now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_session_state_snapshot(&self, session_id: &str, state: &Value) -> FinResult<i64> {
        require_nonempty(session_id, "session_id")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_state_snapshots (session_id, state_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![session_id, redact_payload(state).to_string(), utc_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_latest_session_state_snapshot(&self, session_id: &str) -> FinResult<Value> {
        require_nonempty(session_id, "session_id")?;
        let conn = self.conn.lock();
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT id, state_json, created_at FROM session_state_snapshots
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, state, created_at)) = row else {
            return Err(FinError::not_found(format!(
                "session snapshot not found for session_id={}",
                session_id
            )));
        };
        Ok(json!({
            "snapshot_id": id,
            "session_id": session_id,
            "state": to_json(&state)?,
            "created_at": created_at,
        }))
    }

    pub fn list_session_state_snapshots(
        &self,
        session_id: &str,
        limit: i64,
    ) -> FinResult<Vec<Value>> {
        require_nonempty(session_id, "session_id")?;
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, state_json, created_at FROM session_state_snapshots
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, state, created_at) = row?;
            out.push(json!({
                "snapshot_id": id,
                "session_id": session_id,
                "state": to_json(&state)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    pub fn list_tool_context_deltas(&self, session_id: &str, limit: i64) -> FinResult<Vec<Value>> {
        let limit = require_positive_limit(limit)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, tool_name, input_json, output_json, created_at
             FROM tool_context_deltas WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, session_id, tool_name, input, output, created_at) = row?;
            out.push(json!({
                "id": id,
                "session_id": session_id,
                "tool_name": tool_name,
                "input": to_json(&input)?,
                "output": to_json(&output)?,
                "created_at": created_at,
            }));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Kite candle cache
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_kite_candle_cache(
        &self,
        cache_key: &str,
        symbol: &str,
        instrument_token: &str,
        interval: &str,
        from_ts: &str,
        to_ts: &str,
        row_count: i64,
        dataset_hash: &str,
    ) -> FinResult<()> {
        require_nonempty(cache_key, "cache_key")?;
        if row_count < 0 {
            return Err(FinError::invalid("row_count must be non-negative"));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kite_candle_cache
               (cache_key, symbol, instrument_token, interval, from_ts, to_ts, row_count, dataset_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(cache_key) DO UPDATE SET
               row_count = excluded.row_count,
               dataset_hash = excluded.dataset_hash,
               created_at = excluded.created_at",
            params![
                cache_key,
                symbol,
                instrument_token,
                interval,
                from_ts,
                to_ts,
                row_count,
                dataset_hash,
                utc_now()
            ],
        )?;
        Ok(())
    }

    pub fn get_kite_candle_cache(&self, cache_key: &str) -> FinResult<Option<Value>> {
        require_nonempty(cache_key, "cache_key")?;
        let conn = self.conn.lock();
        let row: Option<(String, String, String, String, String, String, i64, String, String)> =
            conn.query_row(
                "SELECT cache_key, symbol, instrument_token, interval, from_ts, to_ts,
                        row_count, dataset_hash, created_at
                 FROM kite_candle_cache WHERE cache_key = ?1",
                params![cache_key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(
            |(key, symbol, token, interval, from_ts, to_ts, rows, hash, created_at)| {
                json!({
                    "cache_key": key,
                    "symbol": symbol,
                    "instrument_token": token,
                    "interval": interval,
                    "from_ts": from_ts,
                    "to_ts": to_ts,
                    "row_count": rows,
                    "dataset_hash": hash,
                    "created_at": created_at,
                })
            },
        ))
    }
}

fn validate_trial_row(row: &Value) -> FinResult<(String, String, String, f64)> {
    let obj = row
        .as_object()
        .ok_or_else(|| FinError::invalid("tuning payload evaluated_candidates rows must be objects"))?;
    let backtest_run_id = obj
        .get("run_id")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FinError::invalid("tuning payload evaluated candidate missing run_id"))?;
    let params = obj
        .get("params")
        .filter(|v| v.is_object())
        .ok_or_else(|| FinError::invalid("tuning payload evaluated candidate params must be object"))?;
    let metrics = obj
        .get("metrics")
        .filter(|v| v.is_object())
        .ok_or_else(|| FinError::invalid("tuning payload evaluated candidate metrics must be object"))?;
    let score = obj
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            FinError::invalid(format!(
                "tuning payload evaluated candidate score must be numeric: {}",
                obj.get("score").cloned().unwrap_or(Value::Null)
            ))
        })?;
    Ok((backtest_run_id, params.to_string(), metrics.to_string(), score))
}

fn validate_layer_row(layer: &Value) -> FinResult<(String, bool, String)> {
    let obj = layer
        .as_object()
        .ok_or_else(|| FinError::invalid("tuning payload tuning_plan.layers rows must be objects"))?;
    let layer_name = obj
        .get("layer")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FinError::invalid("tuning payload layer decision missing layer"))?;
    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            FinError::invalid(format!(
                "tuning payload layer decision missing reason for layer={}",
                layer_name
            ))
        })?;
    let enabled = obj.get("enabled").and_then(Value::as_bool).unwrap_or(false);
    Ok((layer_name, enabled, reason))
}

/// Recursively merge `updates` into `base`: object values merge key-wise,
/// everything else is replaced.
pub fn deep_merge(base: &mut Value, updates: &Value) {
    if let (Value::Object(base_map), Value::Object(update_map)) = (&mut *base, updates) {
        for (key, value) in update_map {
            match (base_map.get_mut(key), value) {
                (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                    deep_merge(existing, value);
                }
                _ => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *base = updates.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_version_numbers_are_monotonic() {
        let store = StateStore::in_memory().unwrap();
        let spec = json!({"strategy_id": "strat-1", "short_window": 5});
        let first = store.save_strategy_version("alpha", &spec).unwrap();
        let second = store.save_strategy_version("alpha", &spec).unwrap();
        let third = store.save_strategy_version("alpha", &spec).unwrap();
        assert_eq!(first.version_number, 1);
        assert_eq!(second.version_number, 2);
        assert_eq!(third.version_number, 3);
    }

    #[test]
    fn test_save_strategy_version_requires_strategy_id() {
        let store = StateStore::in_memory().unwrap();
        let err = store
            .save_strategy_version("alpha", &json!({"short_window": 5}))
            .unwrap_err();
        assert_eq!(err.code(), "invalid");
    }

    #[test]
    fn test_code_strategy_versions_per_name() {
        let store = StateStore::in_memory().unwrap();
        let v1 = store
            .save_code_strategy_version("momo", "fn prepare(a, b) {}", &json!({"valid": true}))
            .unwrap();
        let v2 = store
            .save_code_strategy_version("momo", "fn prepare(a, b) {}", &json!({"valid": true}))
            .unwrap();
        assert_eq!(v1.strategy_id, v2.strategy_id);
        assert_eq!(v2.version_number, 2);

        let loaded = store
            .get_code_strategy_version(&v2.strategy_version_id)
            .unwrap();
        assert_eq!(loaded["strategy_name"], "momo");
        assert_eq!(loaded["version_number"], 2);
    }

    #[test]
    fn test_list_backtest_runs_rejects_non_positive_limit() {
        let store = StateStore::in_memory().unwrap();
        assert!(store.list_backtest_runs(None, 0).is_err());
        assert!(store.list_backtest_runs(None, -5).is_err());
    }

    #[test]
    fn test_save_tuning_run_persists_children() {
        let store = StateStore::in_memory().unwrap();
        let payload = json!({
            "tuning_run_id": "tune-1",
            "evaluated_candidates": [
                {"run_id": "run-a", "params": {"x": 1}, "metrics": {"sharpe": 1.5}, "score": 1.5},
                {"run_id": "run-b", "params": {"x": 2}, "metrics": {"sharpe": 0.5}, "score": 0.5},
            ],
            "best_candidate": {"run_id": "run-a", "score": 1.5},
            "tuning_plan": {
                "layers": [
                    {"layer": "layer_0", "enabled": true, "reason": "evaluated 2 candidates"},
                ]
            },
        });
        let run_id = store.save_tuning_run("momo", &payload).unwrap();
        assert_eq!(run_id, "tune-1");
        assert_eq!(store.list_tuning_trials("tune-1").unwrap().len(), 2);
        let layers = store.list_tuning_layer_decisions("tune-1").unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0]["layer_name"], "layer_0");
        assert_eq!(layers[0]["enabled"], true);
    }

    #[test]
    fn test_save_tuning_run_rejects_bad_children_atomically() {
        let store = StateStore::in_memory().unwrap();
        let payload = json!({
            "tuning_run_id": "tune-bad",
            "evaluated_candidates": [
                {"run_id": "run-a", "params": {"x": 1}, "metrics": {}, "score": "not-a-number"},
            ],
        });
        assert!(store.save_tuning_run("momo", &payload).is_err());
        // The whole transaction must have rolled back.
        assert!(store.get_tuning_run("tune-bad").is_err());
    }

    #[test]
    fn test_update_tuning_run_deep_merges() {
        let store = StateStore::in_memory().unwrap();
        store
            .save_tuning_run("momo", &json!({"tuning_run_id": "tune-2", "status": "running", "stage": {"layer": 0}}))
            .unwrap();
        store
            .update_tuning_run("tune-2", &json!({"stage": {"evaluated": 3}, "status": "completed"}))
            .unwrap();
        let run = store.get_tuning_run("tune-2").unwrap();
        assert_eq!(run["payload"]["status"], "completed");
        assert_eq!(run["payload"]["stage"]["layer"], 0);
        assert_eq!(run["payload"]["stage"]["evaluated"], 3);
    }

    #[test]
    fn test_upsert_live_state_validates_status() {
        let store = StateStore::in_memory().unwrap();
        let err = store
            .upsert_live_state("v1", "momo", "sleeping", &json!({}))
            .unwrap_err();
        assert_eq!(err.code(), "invalid");
        store
            .upsert_live_state("v1", "momo", "active", &json!({"n": 1}))
            .unwrap();
        store
            .upsert_live_state("v1", "momo", "paused", &json!({"n": 2}))
            .unwrap();
        let state = store.get_live_state("v1").unwrap();
        assert_eq!(state["status"], "paused");
        assert_eq!(state["payload"]["n"], 2);
    }

    #[test]
    fn test_job_terminal_status_idempotent() {
        let store = StateStore::in_memory().unwrap();
        let job_id = store.create_job("tuning", &json!({})).unwrap();
        store
            .update_job_status(&job_id, "running", None, None, None)
            .unwrap();
        store
            .update_job_status(&job_id, "completed", Some(&json!({"ok": true})), None, None)
            .unwrap();
        // Repeating the same terminal status is a no-op.
        store
            .update_job_status(&job_id, "completed", None, None, None)
            .unwrap();
        // Flipping to a different terminal status conflicts.
        let err = store
            .update_job_status(&job_id, "failed", None, Some("boom"), None)
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job["status"], "completed");
        assert_eq!(job["result"]["ok"], true);
    }

    #[test]
    fn test_job_event_cursor_is_strictly_increasing() {
        let store = StateStore::in_memory().unwrap();
        let job_id = store.create_job("tuning", &json!({})).unwrap();
        let first = store
            .append_job_event(&job_id, "tuning.layer.started", &json!({"layer": 0}))
            .unwrap();
        let second = store
            .append_job_event(&job_id, "tuning.layer.completed", &json!({"layer": 0}))
            .unwrap();
        assert!(second > first);

        let all = store.list_job_events_after(0).unwrap();
        assert_eq!(all.len(), 2);
        let after_first = store.list_job_events_after(first).unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0]["id"], second);
    }

    #[test]
    fn test_audit_event_redacts_and_tags_trace() {
        let store = StateStore::in_memory().unwrap();
        store
            .append_audit_event("auth.exchange", &json!({"access_token": "tok_1234567890abcd"}))
            .unwrap();
        let events = store.list_audit_events(Some("auth.exchange")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["payload"]["access_token"], "tok_...abcd");
        assert_eq!(events[0]["payload"]["trace_id"], "no-trace");
    }

    #[test]
    fn test_oauth_state_single_consume() {
        let store = StateStore::in_memory().unwrap();
        store.create_oauth_state("kite", "s1").unwrap();
        store.consume_oauth_state("kite", "s1", 900).unwrap();
        let err = store.consume_oauth_state("kite", "s1", 900).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(err.to_string().contains("already consumed"));
    }

    #[test]
    fn test_consume_latest_requires_exactly_one_pending() {
        let store = StateStore::in_memory().unwrap();
        let err = store.consume_latest_oauth_state("kite", 900).unwrap_err();
        assert!(err.to_string().contains("no pending oauth state"));

        store.create_oauth_state("kite", "s1").unwrap();
        store.create_oauth_state("kite", "s2").unwrap();
        let err = store.consume_latest_oauth_state("kite", 900).unwrap_err();
        assert!(err.to_string().contains("multiple pending oauth states"));

        store.consume_oauth_state("kite", "s1", 900).unwrap();
        let state = store.consume_latest_oauth_state("kite", 900).unwrap();
        assert_eq!(state, "s2");
    }

    #[test]
    fn test_connector_session_round_trip_plaintext() {
        std::env::remove_var("FIN_AGENT_ENCRYPTION_KEY");
        let store = StateStore::in_memory().unwrap();
        assert!(store.get_connector_session("kite").unwrap().is_none());
        store
            .upsert_connector_session("kite", &json!({"user_id": "AB1234"}))
            .unwrap();
        let session = store.get_connector_session("kite").unwrap().unwrap();
        assert_eq!(session["user_id"], "AB1234");
    }

    #[test]
    fn test_kite_candle_cache_key_is_stable() {
        let a = kite_candle_cache_key("INFY", "408065", "day", "2025-01-01", "2025-01-31");
        let b = kite_candle_cache_key("INFY", "408065", "day", "2025-01-01", "2025-01-31");
        let c = kite_candle_cache_key("INFY", "408065", "day", "2025-01-01", "2025-02-28");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_kite_candle_cache_upsert() {
        let store = StateStore::in_memory().unwrap();
        let key = kite_candle_cache_key("INFY", "408065", "day", "a", "b");
        store
            .upsert_kite_candle_cache(&key, "INFY", "408065", "day", "a", "b", 10, "hash-1")
            .unwrap();
        store
            .upsert_kite_candle_cache(&key, "INFY", "408065", "day", "a", "b", 12, "hash-2")
            .unwrap();
        let cached = store.get_kite_candle_cache(&key).unwrap().unwrap();
        assert_eq!(cached["row_count"], 12);
        assert_eq!(cached["dataset_hash"], "hash-2");
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "list": [1, 2]});
        deep_merge(&mut base, &json!({"a": {"c": 3}, "list": [9]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "list": [9]}));
    }
}
