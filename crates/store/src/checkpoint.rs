use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use common::{Candle, Checkpoint, Position, Result, RunKey, RunReport};

use crate::ledger::split_period;
use crate::persistence;

/// Upsert-by-key store of run checkpoints.
#[derive(Clone)]
pub struct CheckpointStore {
    db: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    cursor: i64,
    balance_base: f64,
    balance_quote: f64,
    position_json: Option<String>,
    window_json: String,
    completed: bool,
    report_json: Option<String>,
    updated_at: String,
}

impl CheckpointStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Load the checkpoint for `key`.
    ///
    /// A row that fails validation is logged and reported as absent so the
    /// caller starts fresh.
    pub async fn load(&self, key: &RunKey) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT cursor, balance_base, balance_quote, position_json, window_json,
                   completed, report_json, updated_at
            FROM checkpoints WHERE run_key = ?1
            "#,
        )
        .bind(key.id())
        .fetch_optional(&self.db)
        .await
        .map_err(persistence("checkpoint load"))?;

        let Some(row) = row else {
            debug!(run = %key, "No checkpoint stored");
            return Ok(None);
        };

        match decode(key, row) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(reason) => {
                warn!(run = %key, %reason, "Ignoring malformed checkpoint, starting fresh");
                Ok(None)
            }
        }
    }

    /// Insert or overwrite the checkpoint for `checkpoint.key`.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = &checkpoint.key;
        let (year, month) = split_period(key);
        let position_json = checkpoint
            .position
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let window_json = serde_json::to_string(&checkpoint.window)?;
        let report_json = checkpoint
            .report
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (run_key, pair, interval, year, month, cursor, balance_base, balance_quote,
                 position_json, window_json, completed, report_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(run_key) DO UPDATE SET
                cursor        = excluded.cursor,
                balance_base  = excluded.balance_base,
                balance_quote = excluded.balance_quote,
                position_json = excluded.position_json,
                window_json   = excluded.window_json,
                completed     = excluded.completed,
                report_json   = excluded.report_json,
                updated_at    = excluded.updated_at
            "#,
        )
        .bind(key.id())
        .bind(key.pair())
        .bind(key.interval())
        .bind(year)
        .bind(month)
        .bind(checkpoint.cursor)
        .bind(checkpoint.balance_base)
        .bind(checkpoint.balance_quote)
        .bind(position_json)
        .bind(window_json)
        .bind(checkpoint.completed)
        .bind(report_json)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.db)
        .await
        .map_err(persistence("checkpoint save"))?;

        debug!(
            run = %key,
            cursor = checkpoint.cursor,
            completed = checkpoint.completed,
            "Checkpoint saved"
        );
        Ok(())
    }
}

fn decode(key: &RunKey, row: CheckpointRow) -> std::result::Result<Checkpoint, String> {
    if row.cursor < -1 {
        return Err(format!("negative cursor {}", row.cursor));
    }
    for (name, value) in [("balance_base", row.balance_base), ("balance_quote", row.balance_quote)] {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("{name} is {value}"));
        }
    }

    let position: Option<Position> = row
        .position_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| format!("position: {e}"))?;
    if let Some(p) = &position {
        if !(p.entry_price > 0.0 && p.quantity > 0.0) {
            return Err(format!("position with price {} qty {}", p.entry_price, p.quantity));
        }
    }

    let window: Vec<Candle> =
        serde_json::from_str(&row.window_json).map_err(|e| format!("window: {e}"))?;
    if window.windows(2).any(|w| w[1].close_time <= w[0].close_time) {
        return Err("window close-times not strictly increasing".into());
    }

    let report: Option<RunReport> = row
        .report_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| format!("report: {e}"))?;

    let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
        .map_err(|e| format!("updated_at: {e}"))?
        .with_timezone(&Utc);

    Ok(Checkpoint {
        key: key.clone(),
        cursor: row.cursor,
        balance_base: row.balance_base,
        balance_quote: row.balance_quote,
        position,
        window,
        completed: row.completed,
        report,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PositionSide;

    fn live_key() -> RunKey {
        RunKey::Live {
            bot_id: "main".into(),
            pair: "BTCUSDT".into(),
            interval: "5m".into(),
        }
    }

    fn candle(close_time: i64, close: f64) -> Candle {
        Candle {
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            close_time,
            is_final: true,
        }
    }

    fn checkpoint(cursor: i64) -> Checkpoint {
        Checkpoint {
            key: live_key(),
            cursor,
            balance_base: 0.25,
            balance_quote: 1_000.0,
            position: Some(Position {
                side: PositionSide::Long,
                entry_price: 64_000.0,
                entry_time: Utc::now(),
                quantity: 0.01,
            }),
            window: vec![candle(1, 10.0), candle(2, 11.0)],
            completed: false,
            report: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_checkpoint_loads_as_none() {
        let store = CheckpointStore::new(crate::open_in_memory().await.unwrap());
        assert!(store.load(&live_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_in_place() {
        let db = crate::open_in_memory().await.unwrap();
        let store = CheckpointStore::new(db.clone());

        store.save(&checkpoint(1)).await.unwrap();
        let mut second = checkpoint(2);
        second.position = None;
        second.window.push(candle(3, 12.0));
        store.save(&second).await.unwrap();

        let loaded = store.load(&live_key()).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 2);
        assert!(loaded.position.is_none());
        assert_eq!(loaded.window.len(), 3);
        assert_eq!(loaded.balance_quote, 1_000.0);

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn completed_report_round_trips() {
        let store = CheckpointStore::new(crate::open_in_memory().await.unwrap());
        let mut cp = checkpoint(5);
        cp.completed = true;
        cp.report = Some(RunReport {
            total_trades: 3,
            wins: 2,
            losses: 1,
            win_rate: 66.0,
            total_profit: 12.5,
            initial_base_balance: 1.0,
            final_base_balance: 1.1,
        });
        store.save(&cp).await.unwrap();

        let loaded = store.load(&live_key()).await.unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(loaded.report, cp.report);
        assert_eq!(loaded.position, cp.position);
    }

    #[tokio::test]
    async fn malformed_position_is_treated_as_fresh_start() {
        let db = crate::open_in_memory().await.unwrap();
        let store = CheckpointStore::new(db.clone());
        store.save(&checkpoint(1)).await.unwrap();

        sqlx::query("UPDATE checkpoints SET position_json = '{not json'")
            .execute(&db)
            .await
            .unwrap();

        assert!(store.load(&live_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unordered_window_is_rejected() {
        let store = CheckpointStore::new(crate::open_in_memory().await.unwrap());
        let mut cp = checkpoint(1);
        cp.window = vec![candle(5, 1.0), candle(4, 1.0)];
        store.save(&cp).await.unwrap();

        assert!(store.load(&live_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn negative_balance_is_rejected() {
        let store = CheckpointStore::new(crate::open_in_memory().await.unwrap());
        let mut cp = checkpoint(1);
        cp.balance_base = -1.0;
        store.save(&cp).await.unwrap();

        assert!(store.load(&live_key()).await.unwrap().is_none());
    }
}
