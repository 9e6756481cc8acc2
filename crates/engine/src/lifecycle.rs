use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use common::{EngineState, ExchangeClient, MarketDataSource, Result, RunMode};
use strategy::StrategyFileConfig;

use crate::runner::{BacktestOutcome, RunContext};

/// Cloneable handle for observing the engine and requesting shutdown.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: Arc<RwLock<EngineState>>,
}

impl EngineHandle {
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Ask the run to stop after its in-flight tick. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state == EngineState::Running {
            info!("Engine stopping after the current tick");
            *state = EngineState::Stopping;
        }
        let _ = self.shutdown_tx.send(true);
    }
}

/// What a finished engine run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Backtest(BacktestOutcome),
    /// The live run stopped on request or because the feed ended.
    LiveStopped,
}

/// Drives one run of the configured instrument in the requested mode.
pub struct Engine {
    cfg: StrategyFileConfig,
    db: SqlitePool,
    client: Arc<dyn ExchangeClient>,
    source: Arc<dyn MarketDataSource>,
    state: Arc<RwLock<EngineState>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        cfg: StrategyFileConfig,
        db: SqlitePool,
        client: Arc<dyn ExchangeClient>,
        source: Arc<dyn MarketDataSource>,
    ) -> (Self, EngineHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(EngineState::Stopped));

        let handle = EngineHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            state: state.clone(),
        };
        let engine = Engine {
            cfg,
            db,
            client,
            source,
            state,
            shutdown_rx,
        };
        (engine, handle)
    }

    /// Run to completion or until shutdown is requested through a handle.
    /// Dropping every handle also stops a live run.
    pub async fn run(self, mode: RunMode) -> Result<RunOutcome> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Stopped {
                warn!(state = %*state, "Engine already started");
            }
            *state = EngineState::Running;
        }
        info!(%mode, pair = %self.cfg.instrument.symbol, interval = %self.cfg.instrument.interval, "Engine running");

        let key = match mode {
            RunMode::Backtest => self.cfg.backtest_key(),
            RunMode::Live => self.cfg.live_key(),
        };
        let result = match RunContext::new(key, &self.cfg, self.db.clone(), self.client.clone()) {
            Ok(mut run) => match mode {
                RunMode::Backtest => run
                    .run_backtest(self.source.as_ref(), self.shutdown_rx.clone())
                    .await
                    .map(RunOutcome::Backtest),
                RunMode::Live => run
                    .run_live(self.source.as_ref(), self.shutdown_rx.clone())
                    .await
                    .map(|()| RunOutcome::LiveStopped),
            },
            Err(e) => Err(e),
        };

        *self.state.write().await = EngineState::Stopped;
        info!(%mode, ok = result.is_ok(), "Engine stopped");
        result
    }
}
