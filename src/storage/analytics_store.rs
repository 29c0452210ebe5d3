//! Columnar analytics store.
//!
//! DuckDB-backed point-in-time market data: OHLCV, technicals, fundamentals,
//! corporate actions, ratings, instruments and quotes. Row insertion happens
//! only through the dedicated importers in `crate::data`; every batch write
//! carries `source_file` and `dataset_hash`.

use std::path::Path;

use duckdb::Connection;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{FinError, FinResult};
use crate::storage::paths::RuntimePaths;

pub struct AnalyticsStore {
    conn: Mutex<Connection>,
}

/// One close observation used by the backtest engines and the live lane.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRow {
    pub symbol: String,
    pub date: String,
    pub close: f64,
}

impl AnalyticsStore {
    pub fn open(paths: &RuntimePaths) -> FinResult<Self> {
        paths.ensure()?;
        let conn = Connection::open(paths.analytics_db_path())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> FinResult<Self> {
        let conn = Connection::open(path.as_ref())?;
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

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(&self) -> FinResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS market_ohlcv (
                timestamp TIMESTAMP NOT NULL,
                published_at TIMESTAMP,
                symbol VARCHAR NOT NULL,
                open DOUBLE NOT NULL,
                high DOUBLE NOT NULL,
                low DOUBLE NOT NULL,
                close DOUBLE NOT NULL,
                volume DOUBLE NOT NULL,
                source_file VARCHAR NOT NULL,
                dataset_hash VARCHAR NOT NULL,
                ingested_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS market_technicals (
                timestamp TIMESTAMP NOT NULL,
                symbol VARCHAR NOT NULL,
                sma_short DOUBLE,
                sma_long DOUBLE,
                source VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS market_instruments (
                instrument_token VARCHAR NOT NULL,
                exchange VARCHAR,
                segment VARCHAR,
                tradingsymbol VARCHAR NOT NULL,
                name VARCHAR,
                lot_size DOUBLE,
                tick_size DOUBLE,
                expiry VARCHAR,
                strike DOUBLE,
                instrument_type VARCHAR,
                source VARCHAR NOT NULL,
                dataset_hash VARCHAR NOT NULL,
                fetched_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS market_quotes (
                quote_key VARCHAR NOT NULL,
                instrument_token VARCHAR,
                last_price DOUBLE,
                payload_json VARCHAR NOT NULL,
                source VARCHAR NOT NULL,
                fetched_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS company_fundamentals (
                symbol VARCHAR NOT NULL,
                published_at TIMESTAMP NOT NULL,
                pe_ratio DOUBLE,
                eps DOUBLE,
                payload_json VARCHAR NOT NULL,
                source_file VARCHAR NOT NULL,
                dataset_hash VARCHAR NOT NULL,
                ingested_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS corporate_actions (
                symbol VARCHAR NOT NULL,
                effective_at TIMESTAMP NOT NULL,
                action_type VARCHAR NOT NULL,
                action_value DOUBLE,
                payload_json VARCHAR NOT NULL,
                source_file VARCHAR NOT NULL,
                dataset_hash VARCHAR NOT NULL,
                ingested_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analyst_ratings (
                symbol VARCHAR NOT NULL,
                revised_at TIMESTAMP NOT NULL,
                agency VARCHAR NOT NULL,
                rating VARCHAR NOT NULL,
                payload_json VARCHAR NOT NULL,
                source_file VARCHAR NOT NULL,
                dataset_hash VARCHAR NOT NULL,
                ingested_at TIMESTAMP NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn count_table_rows(&self, table: &str) -> FinResult<i64> {
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(FinError::invalid(format!("invalid table name: {}", table)));
        }
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Maintenance escape hatch; also used by tests to inject PIT anomalies.
    pub fn admin_execute(&self, sql: &str) -> FinResult<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(sql, [])?)
    }

    /// Close rows for the universe/date range sorted by `(symbol, timestamp)`,
    /// with the timestamp collapsed to a `YYYY-MM-DD` date key.
    pub fn query_close_rows(
        &self,
        universe: &[String],
        start_date: &str,
        end_date: &str,
    ) -> FinResult<Vec<CloseRow>> {
        if universe.is_empty() {
            return Err(FinError::invalid("universe must not be empty"));
        }
        let placeholders = vec!["?"; universe.len()].join(",");
        let sql = format!(
            "SELECT symbol, strftime(timestamp, '%Y-%m-%d') AS day, close
             FROM market_ohlcv
             WHERE symbol IN ({placeholders})
               AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)
             ORDER BY symbol, timestamp"
        );
        let mut bind: Vec<String> = universe.to_vec();
        bind.push(start_date.to_string());
        bind.push(end_date.to_string());

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(duckdb::params_from_iter(bind.iter()), |row| {
            Ok(CloseRow {
                symbol: row.get(0)?,
                date: row.get(1)?,
                close: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Closes for one symbol up to `end_date` in timestamp order.
    pub fn query_symbol_closes_until(
        &self,
        symbol: &str,
        end_date: &str,
    ) -> FinResult<Vec<(String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT strftime(timestamp, '%Y-%m-%d') AS day, close
             FROM market_ohlcv
             WHERE symbol = ? AND CAST(timestamp AS DATE) <= CAST(? AS DATE)
             ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(duckdb::params![symbol, end_date], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of OHLCV rows backing a universe/date range (preflight input).
    pub fn count_market_rows(
        &self,
        universe: &[String],
        start_date: &str,
        end_date: &str,
    ) -> FinResult<i64> {
        if universe.is_empty() {
            return Err(FinError::invalid("universe must not be empty"));
        }
        let placeholders = vec!["?"; universe.len()].join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM market_ohlcv
             WHERE symbol IN ({placeholders})
               AND CAST(timestamp AS DATE) BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)"
        );
        let mut bind: Vec<String> = universe.to_vec();
        bind.push(start_date.to_string());
        bind.push(end_date.to_string());
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, duckdb::params_from_iter(bind.iter()), |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &AnalyticsStore) {
        let conn = store.conn();
        conn.execute_batch(
            "INSERT INTO market_ohlcv VALUES
               ('2025-01-02', '2025-01-02', 'ABC', 1, 2, 0.5, 1.5, 100, 'seed.csv', 'h', '2025-01-02'),
               ('2025-01-03', '2025-01-03', 'ABC', 1, 2, 0.5, 1.8, 100, 'seed.csv', 'h', '2025-01-03'),
               ('2025-01-02', '2025-01-02', 'XYZ', 5, 6, 4.0, 5.5, 200, 'seed.csv', 'h', '2025-01-02');",
        )
        .unwrap();
    }

    #[test]
    fn test_query_close_rows_ordering() {
        let store = AnalyticsStore::in_memory().unwrap();
        seed(&store);
        let universe = vec!["XYZ".to_string(), "ABC".to_string()];
        let rows = store
            .query_close_rows(&universe, "2025-01-01", "2025-01-31")
            .unwrap();
        assert_eq!(rows.len(), 3);
        // Deterministic order: symbol ASC then timestamp ASC.
        assert_eq!(rows[0].symbol, "ABC");
        assert_eq!(rows[0].date, "2025-01-02");
        assert_eq!(rows[1].date, "2025-01-03");
        assert_eq!(rows[2].symbol, "XYZ");
    }

    #[test]
    fn test_count_market_rows() {
        let store = AnalyticsStore::in_memory().unwrap();
        seed(&store);
        let count = store
            .count_market_rows(&["ABC".to_string()], "2025-01-01", "2025-01-31")
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_symbol_closes_until() {
        let store = AnalyticsStore::in_memory().unwrap();
        seed(&store);
        let closes = store.query_symbol_closes_until("ABC", "2025-01-02").unwrap();
        assert_eq!(closes, vec![("2025-01-02".to_string(), 1.5)]);
    }

    #[test]
    fn test_count_table_rows_rejects_bad_names() {
        let store = AnalyticsStore::in_memory().unwrap();
        assert!(store.count_table_rows("market_ohlcv; DROP TABLE x").is_err());
    }
}
