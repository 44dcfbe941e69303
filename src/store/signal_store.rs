//! Unified Signal Store
//! Mission: Exactly-once persistence with verifiable fingerprints
//!
//! Single-writer discipline: one rusqlite connection in WAL mode behind a
//! mutex. Writes are idempotent keyed on fingerprint; `update_outcome` is
//! the only permitted post-insert mutation. `order_refs` are never stored
//! here; they are resolved from executor state at read time so the two
//! sides only ever reference each other by id.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

use crate::fingerprint;
use crate::models::{
    Action, BacktestRun, BacktestStatus, CalibrationTag, Regime, RegimeKind, Signal, SignalOutcome,
    TimeRange,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS signals (
    signal_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    confidence REAL NOT NULL,
    entry_price REAL NOT NULL,
    target_price REAL,
    stop_price REAL,
    regime_kind TEXT NOT NULL,
    regime_strength REAL NOT NULL,
    regime_at TEXT NOT NULL,
    strategy_version TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    contributing_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    calibration TEXT NOT NULL,
    outcome TEXT,
    pnl_pct REAL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_signals_symbol_time
    ON signals(symbol, generated_at DESC);

CREATE INDEX IF NOT EXISTS idx_signals_generated
    ON signals(generated_at DESC);

CREATE TABLE IF NOT EXISTS backtest_runs (
    run_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    train_start TEXT NOT NULL,
    train_end TEXT NOT NULL,
    val_start TEXT NOT NULL,
    val_end TEXT NOT NULL,
    test_start TEXT NOT NULL,
    test_end TEXT NOT NULL,
    cost_json TEXT NOT NULL,
    status TEXT NOT NULL,
    metrics_json TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_backtest_runs_symbol
    ON backtest_runs(symbol, created_at DESC);
"#;

/// Typed failures callers branch on; everything else rides anyhow.
#[derive(Debug)]
pub enum StoreError {
    /// Recomputed canonical hash does not match the provided fingerprint.
    InvalidFingerprint { signal_id: String },
    /// Insert would break the id/time ordering invariant.
    NonMonotonic { signal_id: String, detail: String },
    Db(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidFingerprint { signal_id } => {
                write!(f, "INVALID_FINGERPRINT for signal {}", signal_id)
            }
            StoreError::NonMonotonic { signal_id, detail } => {
                write!(f, "non-monotonic insert for signal {}: {}", signal_id, detail)
            }
            StoreError::Db(msg) => write!(f, "signal store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalStats {
    pub total_signals: usize,
    pub window_signals: usize,
    pub by_action: HashMap<String, usize>,
    pub avg_confidence: f64,
    pub wins: usize,
    pub losses: usize,
    pub expired: usize,
    pub premium_count: usize,
}

struct Cursor {
    last_id: Option<String>,
    last_generated_at: Option<DateTime<Utc>>,
}

pub struct SignalStore {
    conn: Mutex<Connection>,
    /// Cached tail of the log for the monotonicity check.
    tail: Mutex<Cursor>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

impl SignalStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open signal store at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize signal store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let tail = conn
            .query_row(
                "SELECT signal_id, generated_at FROM signals ORDER BY signal_id DESC LIMIT 1",
                [],
                |row| {
                    let id: String = row.get(0)?;
                    let at: String = row.get(1)?;
                    Ok((id, at))
                },
            )
            .map(|(id, at)| Cursor {
                last_id: Some(id),
                last_generated_at: DateTime::parse_from_rfc3339(&at)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
            })
            .unwrap_or(Cursor {
                last_id: None,
                last_generated_at: None,
            });

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, existing = count, "signal store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            tail: Mutex::new(tail),
        })
    }

    /// Idempotent insert keyed on fingerprint: a second attempt with an
    /// identical fingerprint returns the existing id without inserting.
    pub fn put(&self, signal: &Signal) -> Result<String, StoreError> {
        if !fingerprint::verify(signal) {
            return Err(StoreError::InvalidFingerprint {
                signal_id: signal.signal_id.clone(),
            });
        }

        let contributing_json = serde_json::to_string(&signal.contributing_sources)
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .prepare_cached("SELECT signal_id FROM signals WHERE fingerprint = ?1 LIMIT 1")?
            .query_row([&signal.fingerprint], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(id) = existing {
            return Ok(id);
        }

        {
            let tail = self.tail.lock();
            if let (Some(last_id), Some(last_at)) = (&tail.last_id, tail.last_generated_at) {
                if signal.signal_id.as_str() > last_id.as_str()
                    && signal.generated_at < last_at
                {
                    return Err(StoreError::NonMonotonic {
                        signal_id: signal.signal_id.clone(),
                        detail: format!(
                            "generated_at {} precedes tail {}",
                            ts(signal.generated_at),
                            ts(last_at)
                        ),
                    });
                }
                if signal.signal_id.as_str() <= last_id.as_str() {
                    return Err(StoreError::NonMonotonic {
                        signal_id: signal.signal_id.clone(),
                        detail: format!("id not greater than tail {}", last_id),
                    });
                }
            }
        }

        conn.prepare_cached(
            "INSERT INTO signals
             (signal_id, symbol, action, confidence, entry_price, target_price, stop_price,
              regime_kind, regime_strength, regime_at, strategy_version, generated_at,
              contributing_json, fingerprint, calibration, outcome, pnl_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )?
        .execute(params![
            signal.signal_id,
            signal.symbol,
            signal.action.as_str(),
            signal.confidence,
            signal.entry_price,
            signal.target_price,
            signal.stop_price,
            signal.regime.kind.as_str(),
            signal.regime.strength,
            ts(signal.regime.classified_at),
            signal.strategy_version,
            ts(signal.generated_at),
            contributing_json,
            signal.fingerprint,
            signal.calibration.as_str(),
            signal.outcome.map(|o| o.as_str()),
            signal.pnl_pct,
        ])?;

        let mut tail = self.tail.lock();
        tail.last_id = Some(signal.signal_id.clone());
        tail.last_generated_at = Some(signal.generated_at);

        Ok(signal.signal_id.clone())
    }

    pub fn get(&self, signal_id: &str) -> Result<Option<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM signals WHERE signal_id = ?1 LIMIT 1",
            SELECT_COLS
        ))?;
        let mut rows = stmt.query([signal_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_signal(row)?)),
            None => Ok(None),
        }
    }

    /// Distributor subscription surface: signals strictly after the cursor,
    /// ascending by id (and therefore by generation time).
    pub fn get_since(&self, cursor: Option<&str>, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let signals = match cursor {
            Some(cursor) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM signals WHERE signal_id > ?1 ORDER BY signal_id ASC LIMIT ?2",
                    SELECT_COLS
                ))?;
                let out: Vec<Signal> = stmt
                    .query_map(params![cursor, limit], row_to_signal)?
                    .filter_map(|r| r.ok())
                    .collect();
                out
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM signals ORDER BY signal_id ASC LIMIT ?1",
                    SELECT_COLS
                ))?;
                let out: Vec<Signal> = stmt
                    .query_map([limit], row_to_signal)?
                    .filter_map(|r| r.ok())
                    .collect();
                out
            }
        };
        Ok(signals)
    }

    /// Newest-first reads for the API surface.
    pub fn latest(&self, limit: usize, min_confidence: Option<f64>) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM signals
             WHERE (?1 IS NULL OR confidence >= ?1)
             ORDER BY generated_at DESC, signal_id DESC
             LIMIT ?2",
            SELECT_COLS
        ))?;
        let signals = stmt
            .query_map(params![min_confidence, limit], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(signals)
    }

    /// The only permitted post-insert mutation.
    pub fn update_outcome(
        &self,
        signal_id: &str,
        outcome: SignalOutcome,
        pnl_pct: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached(
                "UPDATE signals SET outcome = ?1, pnl_pct = ?2 WHERE signal_id = ?3",
            )?
            .execute(params![outcome.as_str(), pnl_pct, signal_id])?;
        Ok(changed > 0)
    }

    /// Outcome-less signals generated before the cutoff; reconciler input.
    pub fn unresolved_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM signals
             WHERE outcome IS NULL AND generated_at < ?1
             ORDER BY generated_at ASC
             LIMIT ?2",
            SELECT_COLS
        ))?;
        let signals = stmt
            .query_map(params![ts(cutoff), limit], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(signals)
    }

    pub fn stats(&self, window_hours: i64, premium_confidence: f64) -> Result<SignalStats> {
        let conn = self.conn.lock();
        let since = ts(Utc::now() - Duration::hours(window_hours.max(1)));

        let total_signals: i64 =
            conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?;

        let mut stmt = conn.prepare_cached(
            "SELECT action, COUNT(*) FROM signals WHERE generated_at >= ?1 GROUP BY action",
        )?;
        let by_action: HashMap<String, usize> = stmt
            .query_map([&since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .filter_map(|r| r.ok())
            .collect();
        let window_signals = by_action.values().sum();

        let avg_confidence: f64 = conn
            .query_row(
                "SELECT AVG(confidence) FROM signals WHERE generated_at >= ?1",
                [&since],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .unwrap_or(0.0);

        let outcome_count = |outcome: &str| -> Result<usize> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM signals WHERE generated_at >= ?1 AND outcome = ?2",
                params![&since, outcome],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        };

        let premium_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE generated_at >= ?1 AND confidence >= ?2",
            params![&since, premium_confidence],
            |row| row.get(0),
        )?;

        Ok(SignalStats {
            total_signals: total_signals as usize,
            window_signals,
            by_action,
            avg_confidence,
            wins: outcome_count("WIN")?,
            losses: outcome_count("LOSS")?,
            expired: outcome_count("EXPIRED")?,
            premium_count: premium_count as usize,
        })
    }

    /// Readiness probe: the store accepts writes.
    pub fn writable(&self) -> bool {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;").is_ok()
    }

    /// Periodic maintenance pass.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize; PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // ----- backtest runs ---------------------------------------------------

    pub fn record_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        let cost_json = serde_json::to_string(&run.cost_model)?;
        let metrics_json = run
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO backtest_runs
             (run_id, symbol, train_start, train_end, val_start, val_end,
              test_start, test_end, cost_json, status, metrics_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                metrics_json = excluded.metrics_json",
        )?
        .execute(params![
            run.run_id,
            run.symbol,
            ts(run.train_range.start),
            ts(run.train_range.end),
            ts(run.val_range.start),
            ts(run.val_range.end),
            ts(run.test_range.start),
            ts(run.test_range.end),
            cost_json,
            run.status.as_str(),
            metrics_json,
        ])?;
        Ok(())
    }

    pub fn get_backtest_run(&self, run_id: &str) -> Result<Option<BacktestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, symbol, train_start, train_end, val_start, val_end,
                    test_start, test_end, cost_json, status, metrics_json
             FROM backtest_runs WHERE run_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }
}

const SELECT_COLS: &str = "signal_id, symbol, action, confidence, entry_price, target_price, \
                           stop_price, regime_kind, regime_strength, regime_at, strategy_version, \
                           generated_at, contributing_json, fingerprint, calibration, outcome, pnl_pct";

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
    let action_str: String = row.get(2)?;
    let regime_kind_str: String = row.get(7)?;
    let outcome_str: Option<String> = row.get(15)?;
    let contributing_json: String = row.get(12)?;
    let calibration_str: String = row.get(14)?;

    let contributing_sources = serde_json::from_str(&contributing_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    Ok(Signal {
        signal_id: row.get(0)?,
        symbol: row.get(1)?,
        action: Action::parse(&action_str).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(
                format!("unknown action {:?}", action_str).into(),
            )
        })?,
        confidence: row.get(3)?,
        entry_price: row.get(4)?,
        target_price: row.get(5)?,
        stop_price: row.get(6)?,
        regime: Regime {
            kind: RegimeKind::parse(&regime_kind_str).unwrap_or(RegimeKind::Chop),
            strength: row.get(8)?,
            classified_at: parse_ts(&row.get::<_, String>(9)?)?,
        },
        strategy_version: row.get(10)?,
        generated_at: parse_ts(&row.get::<_, String>(11)?)?,
        contributing_sources,
        fingerprint: row.get(13)?,
        calibration: CalibrationTag::parse(&calibration_str),
        outcome: outcome_str.as_deref().and_then(SignalOutcome::parse),
        pnl_pct: row.get(16)?,
        order_refs: Vec::new(),
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<BacktestRun> {
    let cost_json: String = row.get(8)?;
    let status_str: String = row.get(9)?;
    let metrics_json: Option<String> = row.get(10)?;

    let range = |a: String, b: String| -> rusqlite::Result<TimeRange> {
        Ok(TimeRange {
            start: parse_ts(&a)?,
            end: parse_ts(&b)?,
        })
    };

    Ok(BacktestRun {
        run_id: row.get(0)?,
        symbol: row.get(1)?,
        train_range: range(row.get(2)?, row.get(3)?)?,
        val_range: range(row.get(4)?, row.get(5)?)?,
        test_range: range(row.get(6)?, row.get(7)?)?,
        cost_model: serde_json::from_str(&cost_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        status: BacktestStatus::parse(&status_str).unwrap_or(BacktestStatus::Failed),
        metrics: metrics_json
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SIM_ORDER_PREFIX;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store() -> (TempDir, SignalStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signals.db");
        let store = SignalStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn sample(idx: u32, at_secs: i64) -> Signal {
        let generated_at = Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap()
            + Duration::seconds(at_secs);
        let mut signal = Signal {
            signal_id: format!("{:016x}-{:08}", generated_at.timestamp_micros(), idx),
            symbol: "AAPL".to_string(),
            action: Action::Buy,
            confidence: 0.8,
            entry_price: 187.0 + idx as f64,
            target_price: Some(191.0),
            stop_price: Some(184.0),
            regime: Regime::cold_start(generated_at),
            strategy_version: "consensus-v1".to_string(),
            generated_at,
            contributing_sources: Vec::new(),
            fingerprint: String::new(),
            calibration: CalibrationTag::Raw,
            outcome: None,
            pnl_pct: None,
            order_refs: Vec::new(),
        };
        signal.fingerprint = fingerprint::compute(&signal);
        signal
    }

    #[test]
    fn put_is_idempotent_on_fingerprint() {
        let (_dir, store) = store();
        let signal = sample(1, 0);

        let first = store.put(&signal).unwrap();
        let second = store.put(&signal).unwrap();
        assert_eq!(first, second);

        let all = store.get_since(None, 100).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn put_rejects_bad_fingerprint() {
        let (_dir, store) = store();
        let mut signal = sample(1, 0);
        signal.fingerprint = "0".repeat(64);

        match store.put(&signal) {
            Err(StoreError::InvalidFingerprint { .. }) => {}
            other => panic!("expected InvalidFingerprint, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn put_rejects_time_regression() {
        let (_dir, store) = store();
        store.put(&sample(1, 100)).unwrap();

        // Later id, earlier generation time.
        let mut bad = sample(2, 50);
        bad.signal_id = format!("{}z", store.get_since(None, 10).unwrap()[0].signal_id);
        bad.fingerprint = fingerprint::compute(&bad);

        match store.put(&bad) {
            Err(StoreError::NonMonotonic { .. }) => {}
            other => panic!("expected NonMonotonic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn get_since_is_ordered_and_exclusive() {
        let (_dir, store) = store();
        let a = sample(1, 0);
        let b = sample(2, 10);
        let c = sample(3, 20);
        for s in [&a, &b, &c] {
            store.put(s).unwrap();
        }

        let all = store.get_since(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].signal_id < w[1].signal_id));
        assert!(all
            .windows(2)
            .all(|w| w[0].generated_at <= w[1].generated_at));

        let after_a = store.get_since(Some(&a.signal_id), 10).unwrap();
        assert_eq!(after_a.len(), 2);
        assert_eq!(after_a[0].signal_id, b.signal_id);
    }

    #[test]
    fn stored_signals_verify_on_read() {
        let (_dir, store) = store();
        store.put(&sample(1, 0)).unwrap();
        let read = store.get_since(None, 1).unwrap().remove(0);
        assert!(fingerprint::verify(&read));
    }

    #[test]
    fn update_outcome_round_trips() {
        let (_dir, store) = store();
        let signal = sample(1, 0);
        store.put(&signal).unwrap();

        assert!(store
            .update_outcome(&signal.signal_id, SignalOutcome::Win, Some(2.4))
            .unwrap());
        let read = store.get(&signal.signal_id).unwrap().unwrap();
        assert_eq!(read.outcome, Some(SignalOutcome::Win));
        assert_eq!(read.pnl_pct, Some(2.4));
        // Outcome mutation must not disturb the fingerprint.
        assert!(fingerprint::verify(&read));
    }

    #[test]
    fn backtest_run_round_trips() {
        let (_dir, store) = store();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let run = BacktestRun {
            run_id: "run-1".to_string(),
            symbol: "AAPL".to_string(),
            train_range: TimeRange { start: t0, end: t0 + Duration::days(60) },
            val_range: TimeRange {
                start: t0 + Duration::days(60),
                end: t0 + Duration::days(80),
            },
            test_range: TimeRange {
                start: t0 + Duration::days(80),
                end: t0 + Duration::days(100),
            },
            cost_model: crate::backtest::CostModel::default(),
            status: BacktestStatus::Complete,
            metrics: None,
        };
        store.record_backtest_run(&run).unwrap();
        let read = store.get_backtest_run("run-1").unwrap().unwrap();
        assert_eq!(read.symbol, "AAPL");
        assert_eq!(read.status, BacktestStatus::Complete);
    }

    #[test]
    fn sim_prefix_constant_is_reserved() {
        assert!(SIM_ORDER_PREFIX.ends_with('_'));
    }
}
