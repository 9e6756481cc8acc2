use sqlx::SqlitePool;
use tracing::{debug, info};

use common::{millis_to_datetime, OrderSide, Result, RunKey, Transaction};

use crate::persistence;

/// Append-only transaction ledger for one run.
///
/// Entries are unique per (run, cursor, leg); appending an entry that is
/// already present is a no-op, so replaying ticks after a resume never
/// duplicates transactions.
#[derive(Clone)]
pub struct Ledger {
    db: SqlitePool,
    key: RunKey,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    side: OrderSide,
    price: f64,
    quantity: f64,
    notional: f64,
    order_id: String,
    timestamp_ms: i64,
    profit: Option<f64>,
    is_closing: bool,
    cursor: i64,
    leg: i64,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Transaction {
            side: row.side,
            price: row.price,
            quantity: row.quantity,
            notional: row.notional,
            order_id: row.order_id,
            timestamp: millis_to_datetime(row.timestamp_ms),
            profit: row.profit,
            is_closing: row.is_closing,
            cursor: row.cursor,
            leg: u8::try_from(row.leg).unwrap_or(0),
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT side, price, quantity, notional, order_id, timestamp_ms, \
     profit, is_closing, cursor, leg FROM transactions";

impl Ledger {
    pub fn new(db: SqlitePool, key: RunKey) -> Self {
        Self { db, key }
    }

    /// Record a transaction. Returns `false` when an entry for the same
    /// cursor and leg was already recorded.
    pub async fn append(&self, tx: &Transaction) -> Result<bool> {
        let (year, month) = split_period(&self.key);

        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (run_key, pair, interval, year, month, cursor, leg, side, price, quantity,
                 notional, order_id, timestamp_ms, profit, is_closing)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(run_key, cursor, leg) DO NOTHING
            "#,
        )
        .bind(self.key.id())
        .bind(self.key.pair())
        .bind(self.key.interval())
        .bind(year)
        .bind(month)
        .bind(tx.cursor)
        .bind(tx.leg as i64)
        .bind(tx.side)
        .bind(tx.price)
        .bind(tx.quantity)
        .bind(tx.notional)
        .bind(&tx.order_id)
        .bind(tx.timestamp.timestamp_millis())
        .bind(tx.profit)
        .bind(tx.is_closing)
        .execute(&self.db)
        .await
        .map_err(persistence("ledger append"))?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            info!(
                run = %self.key,
                side = %tx.side,
                price = tx.price,
                qty = tx.quantity,
                closing = tx.is_closing,
                "Transaction recorded"
            );
        } else {
            debug!(run = %self.key, cursor = tx.cursor, leg = tx.leg, "Transaction already recorded");
        }
        Ok(inserted)
    }

    /// All transactions of this run in ledger order.
    ///
    /// A backtest run owns its pair, interval and month, so it reads
    /// through the period query.
    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        if let Some(period) = self.key.period() {
            return query(&self.db, self.key.pair(), self.key.interval(), Some(period)).await;
        }
        let sql = format!("{SELECT_COLUMNS} WHERE run_key = ?1 ORDER BY timestamp_ms, cursor, leg");
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(self.key.id())
            .fetch_all(&self.db)
            .await
            .map_err(persistence("ledger query"))?;
        Ok(rows.into_iter().map(Transaction::from).collect())
    }
}

/// Transactions for a pair and interval, optionally narrowed to one
/// backtest month, in ledger order.
pub async fn query(
    db: &SqlitePool,
    pair: &str,
    interval: &str,
    period: Option<(i32, u32)>,
) -> Result<Vec<Transaction>> {
    let rows: Vec<TransactionRow> = match period {
        Some((year, month)) => {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE pair = ?1 AND interval = ?2 AND year = ?3 AND month = ?4 \
                 ORDER BY timestamp_ms, cursor, leg"
            );
            sqlx::query_as(&sql)
                .bind(pair)
                .bind(interval)
                .bind(year)
                .bind(month as i64)
                .fetch_all(db)
                .await
        }
        None => {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE pair = ?1 AND interval = ?2 ORDER BY timestamp_ms, cursor, leg"
            );
            sqlx::query_as(&sql).bind(pair).bind(interval).fetch_all(db).await
        }
    }
    .map_err(persistence("ledger query"))?;

    Ok(rows.into_iter().map(Transaction::from).collect())
}

pub(crate) fn split_period(key: &RunKey) -> (Option<i32>, Option<i64>) {
    match key.period() {
        Some((year, month)) => (Some(year), Some(month as i64)),
        None => (None, None),
    }
}
