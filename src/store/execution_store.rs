//! Executor State Ledger
//! Mission: Orders, positions, cursors, and pause flags, keyed by executor
//!
//! Same single-writer rusqlite discipline as the signal store, in its own
//! database file. The unique (executor_id, signal_id) index is what makes
//! redelivery harmless: the second insert is a no-op and callers get the
//! original order back.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::info;

use crate::models::{Action, Order, OrderStatus, Position};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    executor_id TEXT NOT NULL,
    signal_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    price_reference REAL NOT NULL,
    status TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    filled_at TEXT,
    UNIQUE(executor_id, signal_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_signal
    ON orders(signal_id);

CREATE INDEX IF NOT EXISTS idx_orders_executor_time
    ON orders(executor_id, submitted_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    executor_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    qty REAL NOT NULL,
    avg_cost REAL NOT NULL,
    opened_at TEXT NOT NULL,
    signal_id TEXT NOT NULL,
    target_price REAL,
    stop_price REAL,
    PRIMARY KEY (executor_id, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS executor_state (
    executor_id TEXT PRIMARY KEY,
    cursor TEXT,
    paused INTEGER NOT NULL DEFAULT 0,
    paused_reason TEXT,
    pause_latched INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pnl_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    executor_id TEXT NOT NULL,
    signal_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    pnl_pct REAL NOT NULL,
    closed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pnl_events_executor_time
    ON pnl_events(executor_id, closed_at DESC);
"#;

pub struct ExecutionStore {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

impl ExecutionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open execution store at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize execution store schema")?;
        info!(path = db_path, "execution store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ----- orders ----------------------------------------------------------

    /// Insert keyed on (executor_id, signal_id). Returns the already-stored
    /// order when this signal was seen before, making redelivery a no-op.
    pub fn record_order(&self, order: &Order) -> Result<Order> {
        let conn = self.conn.lock();
        let inserted = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO orders
                 (order_id, executor_id, signal_id, symbol, side, qty, price_reference,
                  status, submitted_at, filled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?
            .execute(params![
                order.order_id,
                order.executor_id,
                order.signal_id,
                order.symbol,
                order.side.as_str(),
                order.qty,
                order.price_reference,
                order.status.as_str(),
                ts(order.submitted_at),
                order.filled_at.map(ts),
            ])?;

        if inserted > 0 {
            return Ok(order.clone());
        }
        Self::order_for_signal_locked(&conn, &order.executor_id, &order.signal_id)?
            .context("duplicate order insert found no existing row")
    }

    pub fn order_for_signal(&self, executor_id: &str, signal_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        Self::order_for_signal_locked(&conn, executor_id, signal_id)
    }

    fn order_for_signal_locked(
        conn: &Connection,
        executor_id: &str,
        signal_id: &str,
    ) -> Result<Option<Order>> {
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, executor_id, signal_id, symbol, side, qty, price_reference,
                    status, submitted_at, filled_at
             FROM orders WHERE executor_id = ?1 AND signal_id = ?2 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![executor_id, signal_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_order(row)?)),
            None => Ok(None),
        }
    }

    pub fn orders_for_signal(&self, signal_id: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, executor_id, signal_id, symbol, side, qty, price_reference,
                    status, submitted_at, filled_at
             FROM orders WHERE signal_id = ?1 ORDER BY executor_id",
        )?;
        let orders = stmt
            .query_map([signal_id], row_to_order)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }

    pub fn mark_order_filled(&self, order_id: &str, filled_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("UPDATE orders SET status = ?1, filled_at = ?2 WHERE order_id = ?3")?
            .execute(params![OrderStatus::Filled.as_str(), ts(filled_at), order_id])?;
        Ok(())
    }

    // ----- positions -------------------------------------------------------

    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO positions
             (executor_id, symbol, qty, avg_cost, opened_at, signal_id, target_price, stop_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(executor_id, symbol) DO UPDATE SET
                qty = excluded.qty,
                avg_cost = excluded.avg_cost,
                signal_id = excluded.signal_id,
                target_price = excluded.target_price,
                stop_price = excluded.stop_price",
        )?
        .execute(params![
            position.executor_id,
            position.symbol,
            position.qty,
            position.avg_cost,
            ts(position.opened_at),
            position.signal_id,
            position.target_price,
            position.stop_price,
        ])?;
        Ok(())
    }

    pub fn get_position(&self, executor_id: &str, symbol: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT executor_id, symbol, qty, avg_cost, opened_at, signal_id,
                    target_price, stop_price
             FROM positions WHERE executor_id = ?1 AND symbol = ?2 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![executor_id, symbol])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_position(row)?)),
            None => Ok(None),
        }
    }

    pub fn open_positions(&self, executor_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT executor_id, symbol, qty, avg_cost, opened_at, signal_id,
                    target_price, stop_price
             FROM positions WHERE executor_id = ?1 ORDER BY opened_at",
        )?;
        let positions = stmt
            .query_map([executor_id], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    pub fn open_position_count(&self, executor_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE executor_id = ?1",
            [executor_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Remove the position and record the realized pnl event.
    pub fn close_position(
        &self,
        executor_id: &str,
        symbol: &str,
        signal_id: &str,
        pnl_pct: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        conn.prepare_cached("DELETE FROM positions WHERE executor_id = ?1 AND symbol = ?2")?
            .execute(params![executor_id, symbol])?;
        conn.prepare_cached(
            "INSERT INTO pnl_events (executor_id, signal_id, symbol, pnl_pct, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![executor_id, signal_id, symbol, pnl_pct, ts(closed_at)])?;
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    /// Sum of realized pnl percentages since the UTC midnight before `now`.
    pub fn realized_daily_pnl_pct(&self, executor_id: &str, now: DateTime<Utc>) -> Result<f64> {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now - Duration::hours(24));
        let conn = self.conn.lock();
        let sum: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(pnl_pct), 0.0) FROM pnl_events
                 WHERE executor_id = ?1 AND closed_at >= ?2",
                params![executor_id, ts(midnight)],
                |row| row.get(0),
            )
            .unwrap_or(0.0);
        Ok(sum)
    }

    // ----- executor state --------------------------------------------------

    pub fn ensure_executor(&self, executor_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("INSERT OR IGNORE INTO executor_state (executor_id) VALUES (?1)")?
            .execute([executor_id])?;
        Ok(())
    }

    pub fn get_cursor(&self, executor_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let cursor: Option<String> = conn
            .query_row(
                "SELECT cursor FROM executor_state WHERE executor_id = ?1",
                [executor_id],
                |row| row.get(0),
            )
            .unwrap_or(None);
        Ok(cursor)
    }

    pub fn set_cursor(&self, executor_id: &str, cursor: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO executor_state (executor_id, cursor) VALUES (?1, ?2)
             ON CONFLICT(executor_id) DO UPDATE SET cursor = excluded.cursor",
        )?
        .execute(params![executor_id, cursor])?;
        Ok(())
    }

    pub fn set_paused(
        &self,
        executor_id: &str,
        paused: bool,
        reason: Option<&str>,
        latched: bool,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO executor_state (executor_id, paused, paused_reason, pause_latched)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(executor_id) DO UPDATE SET
                paused = excluded.paused,
                paused_reason = excluded.paused_reason,
                pause_latched = excluded.pause_latched",
        )?
        .execute(params![executor_id, paused as i64, reason, latched as i64])?;
        Ok(())
    }

    /// (paused, reason, latched)
    pub fn pause_state(&self, executor_id: &str) -> Result<(bool, Option<String>, bool)> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT paused, paused_reason, pause_latched FROM executor_state
                 WHERE executor_id = ?1",
                [executor_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)? != 0,
                    ))
                },
            )
            .unwrap_or((false, None, false));
        Ok(state)
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let side_str: String = row.get(4)?;
    let status_str: String = row.get(7)?;
    let filled_at: Option<String> = row.get(9)?;
    Ok(Order {
        order_id: row.get(0)?,
        executor_id: row.get(1)?,
        signal_id: row.get(2)?,
        symbol: row.get(3)?,
        side: Action::parse(&side_str).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(format!("unknown side {:?}", side_str).into())
        })?,
        qty: row.get(5)?,
        price_reference: row.get(6)?,
        status: OrderStatus::parse(&status_str).unwrap_or(OrderStatus::Pending),
        submitted_at: parse_ts(&row.get::<_, String>(8)?)?,
        filled_at: filled_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    Ok(Position {
        executor_id: row.get(0)?,
        symbol: row.get(1)?,
        qty: row.get(2)?,
        avg_cost: row.get(3)?,
        opened_at: parse_ts(&row.get::<_, String>(4)?)?,
        signal_id: row.get(5)?,
        target_price: row.get(6)?,
        stop_price: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store() -> (TempDir, ExecutionStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("execution.db");
        let store = ExecutionStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 15, 0, 0).unwrap()
    }

    fn order(order_id: &str, signal_id: &str) -> Order {
        Order {
            order_id: order_id.to_string(),
            executor_id: "standard".to_string(),
            signal_id: signal_id.to_string(),
            symbol: "AAPL".to_string(),
            side: Action::Buy,
            qty: 10.0,
            price_reference: 187.0,
            status: OrderStatus::Filled,
            submitted_at: now(),
            filled_at: Some(now()),
        }
    }

    #[test]
    fn duplicate_signal_returns_original_order() {
        let (_dir, store) = store();
        let first = store.record_order(&order("ord-1", "sig-1")).unwrap();
        // Redelivery tries a fresh order id for the same signal.
        let second = store.record_order(&order("ord-2", "sig-1")).unwrap();

        assert_eq!(first.order_id, "ord-1");
        assert_eq!(second.order_id, "ord-1");
        assert_eq!(store.orders_for_signal("sig-1").unwrap().len(), 1);
    }

    #[test]
    fn position_lifecycle_records_pnl() {
        let (_dir, store) = store();
        store
            .upsert_position(&Position {
                executor_id: "standard".to_string(),
                symbol: "AAPL".to_string(),
                qty: 10.0,
                avg_cost: 180.0,
                opened_at: now(),
                signal_id: "sig-1".to_string(),
                target_price: Some(190.0),
                stop_price: Some(175.0),
            })
            .unwrap();

        assert_eq!(store.open_position_count("standard").unwrap(), 1);

        store
            .close_position("standard", "AAPL", "sig-1", 2.5, now())
            .unwrap();
        assert_eq!(store.open_position_count("standard").unwrap(), 0);
        let daily = store.realized_daily_pnl_pct("standard", now()).unwrap();
        assert!((daily - 2.5).abs() < 1e-9);
    }

    #[test]
    fn cursor_and_pause_state_persist() {
        let (_dir, store) = store();
        store.ensure_executor("prop_firm").unwrap();
        assert_eq!(store.get_cursor("prop_firm").unwrap(), None);

        store.set_cursor("prop_firm", "sig-42").unwrap();
        assert_eq!(store.get_cursor("prop_firm").unwrap().as_deref(), Some("sig-42"));

        store
            .set_paused("prop_firm", true, Some("DRAWDOWN_LIMIT"), true)
            .unwrap();
        let (paused, reason, latched) = store.pause_state("prop_firm").unwrap();
        assert!(paused && latched);
        assert_eq!(reason.as_deref(), Some("DRAWDOWN_LIMIT"));
    }

    #[test]
    fn daily_pnl_ignores_prior_days() {
        let (_dir, store) = store();
        let yesterday = now() - Duration::days(1);
        store
            .upsert_position(&Position {
                executor_id: "standard".to_string(),
                symbol: "AAPL".to_string(),
                qty: 1.0,
                avg_cost: 100.0,
                opened_at: yesterday,
                signal_id: "sig-0".to_string(),
                target_price: None,
                stop_price: None,
            })
            .unwrap();
        store
            .close_position("standard", "AAPL", "sig-0", -4.0, yesterday)
            .unwrap();

        let daily = store.realized_daily_pnl_pct("standard", now()).unwrap();
        assert_eq!(daily, 0.0);
    }
}
