use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use common::{
    millis_to_datetime, month_range, Candle, Checkpoint, ExchangeClient, MarketDataSource, Result,
    RunKey, RunReport, Transaction,
};
use store::{CheckpointStore, Ledger};
use strategy::{score, Evaluation, StrategyFileConfig, TrendAnalyzer};

use crate::executor::OrderExecutor;
use crate::position::{PositionStateMachine, Tick};
use crate::window::RollingWindow;

/// How a backtest run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BacktestOutcome {
    /// Every index processed and scored.
    Completed(RunReport),
    /// Shutdown requested; resumable from the stored checkpoint.
    Interrupted { cursor: i64 },
}

/// Everything one instrument run owns: indicators, position, window, venue
/// access and persistence. Ticks are processed strictly one at a time.
pub struct RunContext {
    key: RunKey,
    cfg: StrategyFileConfig,
    analyzer: TrendAnalyzer,
    machine: PositionStateMachine,
    window: RollingWindow,
    executor: OrderExecutor,
    ledger: Ledger,
    checkpoints: CheckpointStore,
    /// Last processed index or close-time; -1 before the first tick.
    cursor: i64,
    /// Last (base, quote) balances read from the venue.
    balances: (f64, f64),
    /// Transactions executed by this process, for scoring when the ledger
    /// cannot be read back.
    journal: Vec<Transaction>,
}

impl RunContext {
    pub fn new(
        key: RunKey,
        cfg: &StrategyFileConfig,
        db: SqlitePool,
        client: Arc<dyn ExchangeClient>,
    ) -> Result<Self> {
        let analyzer = TrendAnalyzer::new(&cfg.indicators)?;
        let executor = OrderExecutor::new(client, cfg.instrument(), cfg.sizing.fraction);
        Ok(Self {
            ledger: Ledger::new(db.clone(), key.clone()),
            checkpoints: CheckpointStore::new(db),
            key,
            cfg: cfg.clone(),
            analyzer,
            machine: PositionStateMachine::default(),
            window: RollingWindow::new(cfg.live.window_capacity),
            executor,
            cursor: -1,
            balances: (0.0, 0.0),
            journal: Vec::new(),
        })
    }

    pub fn machine(&self) -> &PositionStateMachine {
        &self.machine
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    /// Replay the configured month, resuming from an incomplete checkpoint.
    ///
    /// A run whose checkpoint is already complete is re-scored from the
    /// ledger without replaying.
    pub async fn run_backtest(
        &mut self,
        source: &dyn MarketDataSource,
        shutdown: watch::Receiver<bool>,
    ) -> Result<BacktestOutcome> {
        let warmup = self.cfg.backtest.warmup.max(self.analyzer.lookback());

        let start = match self.load_checkpoint().await {
            Some(cp) if cp.completed => {
                info!(run = %self.key, "Backtest already completed, re-scoring ledger");
                let transactions = self.ledger.transactions().await?;
                let report = score(&transactions, &self.cfg.scoring, self.cfg.backtest.initial_base);
                return Ok(BacktestOutcome::Completed(report));
            }
            Some(cp) => {
                let resume_at = warmup.max(usize::try_from(cp.cursor + 1).unwrap_or(0));
                self.restore(cp).await;
                info!(run = %self.key, resume_at, "Resuming backtest");
                resume_at
            }
            None => {
                self.refresh_balances().await;
                info!(run = %self.key, warmup, "Starting backtest");
                warmup
            }
        };

        let (year, month) = (self.cfg.backtest.year, self.cfg.backtest.month);
        let (start_ms, end_ms) = month_range(year, month)?;
        let candles = source
            .fetch_history(self.key.pair(), self.key.interval(), start_ms, end_ms)
            .await?;
        let start = start.min(candles.len());
        info!(run = %self.key, candles = candles.len(), start, "History loaded");

        // Indicators for each index only read closes before it, so they can
        // be computed ahead in parallel. Transitions stay serial below.
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let analyzer = &self.analyzer;
        let evaluations: Vec<Result<Evaluation>> = (start..candles.len())
            .into_par_iter()
            .map(|i| analyzer.evaluate(&closes[..i]))
            .collect();

        let every = self.cfg.backtest.checkpoint_every.max(1);
        for (i, evaluation) in (start..).zip(evaluations) {
            if *shutdown.borrow() {
                info!(run = %self.key, cursor = self.cursor, "Shutdown requested, checkpointing backtest");
                self.persist(false, None).await;
                return Ok(BacktestOutcome::Interrupted { cursor: self.cursor });
            }

            let cursor = i as i64;
            self.step(evaluation, &candles[i], cursor).await;
            self.cursor = cursor;

            if i % every == 0 {
                self.persist(false, None).await;
            }
        }

        let transactions = match self.ledger.transactions().await {
            Ok(transactions) => transactions,
            Err(e) => {
                error!(run = %self.key, error = %e, "Ledger unreadable, scoring this session only");
                self.journal.clone()
            }
        };
        let report = score(&transactions, &self.cfg.scoring, self.cfg.backtest.initial_base);
        info!(
            run = %self.key,
            trades = report.total_trades,
            wins = report.wins,
            losses = report.losses,
            win_rate = report.win_rate,
            profit = report.total_profit,
            final_base = report.final_base_balance,
            "Backtest complete"
        );

        self.persist(true, Some(report.clone())).await;
        Ok(BacktestOutcome::Completed(report))
    }

    /// Follow the live candle feed until shutdown or the feed ends.
    ///
    /// The checkpoint is written after every final candle and once more on
    /// exit.
    pub async fn run_live(
        &mut self,
        source: &dyn MarketDataSource,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        match self.load_checkpoint().await {
            Some(cp) => {
                self.restore(cp).await;
                info!(run = %self.key, window = self.window.len(), cursor = self.cursor, "Resuming live run");
            }
            None => {
                self.refresh_balances().await;
                info!(run = %self.key, "Starting live run");
            }
        }

        // Candles that closed while the process was down fill the restored
        // window before the first live tick; stale ones are refused by `push`.
        match source
            .recent(self.key.pair(), self.key.interval(), self.window.capacity())
            .await
        {
            Ok(candles) => {
                let added = candles.into_iter().filter(|c| c.is_valid() && self.window.push(*c)).count();
                info!(run = %self.key, added, window = self.window.len(), "Window caught up from recent candles");
            }
            Err(e) => warn!(run = %self.key, error = %e, "Could not fetch recent candles, warming up from the feed"),
        }

        let mut candles = source.subscribe(self.key.pair(), self.key.interval()).await?;

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(run = %self.key, "Shutdown requested, stopping live run");
                            break;
                        }
                    }
                    next = candles.recv() => match next {
                        Some(candle) => self.on_live_candle(candle).await,
                        None => {
                            warn!(run = %self.key, "Market data feed ended");
                            break;
                        }
                    },
                }
            }
        }

        self.persist(false, None).await;
        Ok(())
    }

    async fn on_live_candle(&mut self, candle: Candle) {
        if !candle.is_final {
            return;
        }
        if !candle.is_valid() {
            warn!(run = %self.key, close_time = candle.close_time, "Discarding invalid candle");
            return;
        }
        if !self.window.push(candle) {
            debug!(run = %self.key, close_time = candle.close_time, "Stale candle ignored");
            return;
        }

        let evaluation = self.analyzer.evaluate(&self.window.closes());
        self.step(evaluation, &candle, candle.close_time).await;
        self.cursor = candle.close_time;
        self.persist(false, None).await;
    }

    /// One tick: transition on the evaluation and ledger the result.
    async fn step(&mut self, evaluation: Result<Evaluation>, candle: &Candle, cursor: i64) {
        self.executor.observe_price(candle.close).await;

        let evaluation = match evaluation {
            Ok(evaluation) => evaluation,
            Err(e) if e.is_per_tick() => {
                debug!(run = %self.key, cursor, error = %e, "No signal this tick");
                return;
            }
            Err(e) => {
                warn!(run = %self.key, cursor, error = %e, "Evaluation failed, holding");
                return;
            }
        };
        debug!(
            run = %self.key,
            cursor,
            rsi = evaluation.rsi,
            macd = evaluation.macd.macd,
            signal = evaluation.macd.signal,
            score = evaluation.score,
            "Evaluated"
        );

        let tick = Tick {
            price: candle.close,
            time: millis_to_datetime(candle.close_time),
            cursor,
        };
        let outcome = self.machine.apply(evaluation.decision, &tick, &self.executor).await;

        if let Some(e) = &outcome.skipped {
            warn!(run = %self.key, cursor, error = %e, "Transition skipped");
        }
        if outcome.transactions.is_empty() {
            return;
        }

        for tx in &outcome.transactions {
            if let Err(e) = self.ledger.append(tx).await {
                error!(run = %self.key, cursor, error = %e, "Ledger append failed, resume will not see this transaction");
            }
        }
        self.journal.extend(outcome.transactions);
        self.refresh_balances().await;
    }

    async fn load_checkpoint(&self) -> Option<Checkpoint> {
        match self.checkpoints.load(&self.key).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(run = %self.key, error = %e, "Checkpoint load failed, starting fresh");
                None
            }
        }
    }

    async fn restore(&mut self, cp: Checkpoint) {
        self.executor.restore_balances(cp.balance_base, cp.balance_quote).await;
        self.balances = (cp.balance_base, cp.balance_quote);
        self.machine = PositionStateMachine::new(cp.position);
        self.window = RollingWindow::restore(self.cfg.live.window_capacity, cp.window);
        self.cursor = cp.cursor;
    }

    async fn refresh_balances(&mut self) {
        match self.executor.balances().await {
            Ok(balances) => self.balances = balances,
            Err(e) => warn!(run = %self.key, error = %e, "Balance refresh failed, keeping last known"),
        }
    }

    async fn persist(&self, completed: bool, report: Option<RunReport>) {
        let checkpoint = Checkpoint {
            key: self.key.clone(),
            cursor: self.cursor,
            balance_base: self.balances.0,
            balance_quote: self.balances.1,
            position: self.machine.position().cloned(),
            window: match self.key {
                RunKey::Backtest { .. } => Vec::new(),
                RunKey::Live { .. } => self.window.snapshot(),
            },
            completed,
            report,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            error!(run = %self.key, cursor = self.cursor, error = %e, "Checkpoint write failed, resume fidelity degraded");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use common::{Error, Fill, Order, OrderSide};
    use paper::PaperClient;

    const FIVE_MINUTES: i64 = 300_000;
    const T0: i64 = 1_722_470_699_999;

    fn candle(i: usize, close: f64) -> Candle {
        Candle {
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            close_time: T0 + i as i64 * FIVE_MINUTES,
            is_final: true,
        }
    }

    /// Slow declines ending in a sharp bounce, then slow rallies ending in a
    /// sharp drop; each turn crosses the entry threshold.
    fn sawtooth(cycles: usize) -> Vec<Candle> {
        let mut closes = Vec::new();
        let mut price = 500.0;
        for _ in 0..cycles {
            for _ in 0..60 {
                price -= 1.0;
                closes.push(price);
            }
            price += 4.0;
            closes.push(price);
            for _ in 0..60 {
                price += 1.0;
                closes.push(price);
            }
            price -= 4.0;
            closes.push(price);
        }
        closes.into_iter().enumerate().map(|(i, c)| candle(i, c)).collect()
    }

    fn config() -> StrategyFileConfig {
        let mut cfg = StrategyFileConfig::default();
        cfg.backtest.initial_base = 1.0;
        cfg.backtest.initial_quote = 1_000.0;
        cfg.backtest.checkpoint_every = 10;
        cfg
    }

    fn paper(cfg: &StrategyFileConfig) -> Arc<PaperClient> {
        Arc::new(PaperClient::new(
            cfg.instrument(),
            cfg.backtest.initial_base,
            cfg.backtest.initial_quote,
            0.0,
        ))
    }

    struct History(Vec<Candle>);

    #[async_trait]
    impl MarketDataSource for History {
        async fn fetch_history(&self, pair: &str, _: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
            if self.0.is_empty() {
                return Err(Error::DataGap { pair: pair.into(), start_ms, end_ms });
            }
            Ok(self.0.clone())
        }

        async fn recent(&self, _: &str, _: &str, limit: usize) -> Result<Vec<Candle>> {
            let skip = self.0.len().saturating_sub(limit);
            Ok(self.0[skip..].to_vec())
        }

        async fn subscribe(&self, _: &str, _: &str) -> Result<mpsc::Receiver<Candle>> {
            Err(Error::WebSocket("history only".into()))
        }
    }

    /// Live feed fed from a test-held channel.
    struct Feed {
        recent: Vec<Candle>,
        recent_calls: AtomicUsize,
        rx: Mutex<Option<mpsc::Receiver<Candle>>>,
    }

    impl Feed {
        fn new(recent: Vec<Candle>) -> (Self, mpsc::Sender<Candle>) {
            let (tx, rx) = mpsc::channel(16);
            let feed = Feed {
                recent,
                recent_calls: AtomicUsize::new(0),
                rx: Mutex::new(Some(rx)),
            };
            (feed, tx)
        }
    }

    #[async_trait]
    impl MarketDataSource for Feed {
        async fn fetch_history(&self, pair: &str, _: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
            Err(Error::DataGap { pair: pair.into(), start_ms, end_ms })
        }

        async fn recent(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>> {
            self.recent_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.recent.clone())
        }

        async fn subscribe(&self, _: &str, _: &str) -> Result<mpsc::Receiver<Candle>> {
            self.rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::WebSocket("already subscribed".into()))
        }
    }

    /// Paper venue that requests shutdown after a number of fills.
    struct Tripwire {
        inner: PaperClient,
        remaining: AtomicUsize,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl ExchangeClient for Tripwire {
        async fn balance(&self, asset: &str) -> Result<f64> {
            self.inner.balance(asset).await
        }

        async fn place_market_order(&self, order: &Order) -> Result<Fill> {
            let fill = self.inner.place_market_order(order).await?;
            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _ = self.shutdown.send(true);
            }
            Ok(fill)
        }

        async fn observe_price(&self, pair: &str, price: f64) {
            self.inner.observe_price(pair, price).await;
        }

        async fn sync_balance(&self, asset: &str, amount: f64) {
            self.inner.sync_balance(asset, amount).await;
        }
    }

    /// Paper venue that stops answering once it has filled a number of
    /// orders, like a process dying mid-run.
    struct Stalling {
        inner: PaperClient,
        fills_left: AtomicUsize,
        stalled: tokio::sync::Notify,
    }

    impl Stalling {
        async fn gate(&self) {
            if self.fills_left.load(Ordering::SeqCst) == 0 {
                self.stalled.notify_one();
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for Stalling {
        async fn balance(&self, asset: &str) -> Result<f64> {
            self.gate().await;
            self.inner.balance(asset).await
        }

        async fn place_market_order(&self, order: &Order) -> Result<Fill> {
            self.gate().await;
            let fill = self.inner.place_market_order(order).await?;
            self.fills_left.fetch_sub(1, Ordering::SeqCst);
            Ok(fill)
        }

        async fn observe_price(&self, pair: &str, price: f64) {
            self.inner.observe_price(pair, price).await;
        }

        async fn sync_balance(&self, asset: &str, amount: f64) {
            self.inner.sync_balance(asset, amount).await;
        }
    }

    /// Venue that refuses every order.
    struct Refusing(PaperClient, AtomicUsize);

    #[async_trait]
    impl ExchangeClient for Refusing {
        async fn balance(&self, asset: &str) -> Result<f64> {
            self.0.balance(asset).await
        }

        async fn place_market_order(&self, _: &Order) -> Result<Fill> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err(Error::Exchange("venue offline".into()))
        }
    }

    fn comparable(txs: &[Transaction]) -> Vec<(OrderSide, f64, f64, i64, u8, bool, Option<f64>)> {
        txs.iter()
            .map(|t| (t.side, t.price, t.quantity, t.cursor, t.leg, t.is_closing, t.profit))
            .collect()
    }

    async fn one_pass(cfg: &StrategyFileConfig, candles: &[Candle]) -> (RunReport, Vec<Transaction>) {
        let db = store::open_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), cfg, db, paper(cfg)).unwrap();
        let outcome = run.run_backtest(&History(candles.to_vec()), rx).await.unwrap();
        let BacktestOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        (report, run.ledger.transactions().await.unwrap())
    }

    #[tokio::test]
    async fn backtest_trades_each_turn_and_completes() {
        let cfg = config();
        let candles = sawtooth(4);
        let db = store::open_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), paper(&cfg)).unwrap();

        let outcome = run.run_backtest(&History(candles.clone()), rx).await.unwrap();
        let BacktestOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };

        let txs = run.ledger.transactions().await.unwrap();
        assert!(txs.len() >= 3, "expected an open and a flip, got {}", txs.len());
        assert_eq!(txs[0].side, OrderSide::Buy, "first signal is the bounce off the low");
        assert!(!txs[0].is_closing);
        assert!(txs.iter().all(|t| t.cursor >= cfg.backtest.warmup as i64));
        assert!(txs.windows(2).all(|w| (w[0].cursor, w[0].leg) < (w[1].cursor, w[1].leg)));
        for tx in &txs {
            let candle = &candles[tx.cursor as usize];
            assert_eq!(tx.price, candle.close);
            assert_eq!(tx.timestamp.timestamp_millis(), candle.close_time);
        }
        // every leg-1 entry follows the closing entry of the same tick
        for (i, tx) in txs.iter().enumerate().filter(|(_, t)| t.leg == 1) {
            assert!(txs[i - 1].is_closing);
            assert_eq!(txs[i - 1].cursor, tx.cursor);
            assert_eq!(txs[i - 1].side, tx.side);
        }

        let expected = score(&txs, &cfg.scoring, cfg.backtest.initial_base);
        assert_eq!(report, expected);

        let cp = CheckpointStore::new(db).load(&cfg.backtest_key()).await.unwrap().unwrap();
        assert!(cp.completed);
        assert_eq!(cp.cursor, candles.len() as i64 - 1);
        assert_eq!(cp.report, Some(report));
        assert!(cp.window.is_empty());
    }

    #[tokio::test]
    async fn interrupted_backtest_resumes_to_identical_ledger() {
        let cfg = config();
        let candles = sawtooth(4);
        let (expected_report, expected_txs) = one_pass(&cfg, &candles).await;
        assert!(expected_txs.len() >= 3);

        let db = store::open_in_memory().await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let venue = Arc::new(Tripwire {
            inner: PaperClient::new(cfg.instrument(), 1.0, 1_000.0, 0.0),
            remaining: AtomicUsize::new(2),
            shutdown: shutdown_tx,
        });

        let mut first = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), venue).unwrap();
        let outcome = first.run_backtest(&History(candles.clone()), shutdown_rx).await.unwrap();
        let BacktestOutcome::Interrupted { cursor } = outcome else {
            panic!("expected interruption");
        };
        assert!(cursor > 0 && (cursor as usize) < candles.len() - 1);

        let cp = CheckpointStore::new(db.clone()).load(&cfg.backtest_key()).await.unwrap().unwrap();
        assert!(!cp.completed);
        assert_eq!(cp.cursor, cursor);

        // fresh process: new venue at the initial balances, same database
        let (_tx, rx) = watch::channel(false);
        let mut second = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
        let outcome = second.run_backtest(&History(candles.clone()), rx).await.unwrap();
        let BacktestOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };

        let txs = second.ledger.transactions().await.unwrap();
        assert_eq!(comparable(&txs), comparable(&expected_txs));
        assert_eq!(report, expected_report);
    }

    #[tokio::test]
    async fn crashed_backtest_replays_from_cadence_checkpoint_without_duplicates() {
        let cfg = config();
        let candles = sawtooth(4);
        let (expected_report, expected_txs) = one_pass(&cfg, &candles).await;
        assert!(expected_txs.len() >= 5);

        let mut ledger_ran_ahead = false;
        for fills in [1, 2, 3, 5] {
            let db = store::open_in_memory().await.unwrap();
            let venue = Arc::new(Stalling {
                inner: PaperClient::new(cfg.instrument(), 1.0, 1_000.0, 0.0),
                fills_left: AtomicUsize::new(fills),
                stalled: tokio::sync::Notify::new(),
            });

            // the run is dropped mid-tick, with no shutdown checkpoint
            let (_tx, rx) = watch::channel(false);
            let mut first = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), venue.clone()).unwrap();
            let history = History(candles.clone());
            let crashed = tokio::time::timeout(std::time::Duration::from_secs(10), async {
                tokio::select! {
                    _ = first.run_backtest(&history, rx) => false,
                    _ = venue.stalled.notified() => true,
                }
            })
            .await
            .unwrap();
            assert!(crashed, "venue stalled after {fills} fills");
            drop(first);

            let cp = CheckpointStore::new(db.clone()).load(&cfg.backtest_key()).await.unwrap().unwrap();
            assert!(!cp.completed);
            let ledgered = Ledger::new(db.clone(), cfg.backtest_key()).transactions().await.unwrap();
            assert!(!ledgered.is_empty());
            ledger_ran_ahead |= ledgered.iter().any(|t| t.cursor > cp.cursor);

            let (_tx, rx) = watch::channel(false);
            let mut second = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
            let BacktestOutcome::Completed(report) = second.run_backtest(&history, rx).await.unwrap() else {
                panic!("expected completion");
            };

            let txs = second.ledger.transactions().await.unwrap();
            assert_eq!(comparable(&txs), comparable(&expected_txs), "after {fills} fills");
            assert_eq!(report, expected_report, "after {fills} fills");
        }
        assert!(ledger_ran_ahead, "some crash left ledger entries past the checkpoint");
    }

    #[tokio::test]
    async fn completed_backtest_is_rescored_not_replayed() {
        let cfg = config();
        let candles = sawtooth(2);
        let db = store::open_in_memory().await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
        let BacktestOutcome::Completed(report) = run.run_backtest(&History(candles), rx).await.unwrap() else {
            panic!("expected completion");
        };

        let venue = Arc::new(Refusing(
            PaperClient::new(cfg.instrument(), 1.0, 1_000.0, 0.0),
            AtomicUsize::new(0),
        ));
        let (_tx, rx) = watch::channel(false);
        let mut again = RunContext::new(cfg.backtest_key(), &cfg, db, venue.clone()).unwrap();
        // an empty source would be a data gap if it were consulted
        let outcome = again.run_backtest(&History(Vec::new()), rx).await.unwrap();
        assert_eq!(outcome, BacktestOutcome::Completed(report));
        assert_eq!(venue.1.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refused_orders_leave_run_flat() {
        let cfg = config();
        let venue = Arc::new(Refusing(
            PaperClient::new(cfg.instrument(), 1.0, 1_000.0, 0.0),
            AtomicUsize::new(0),
        ));
        let db = store::open_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), &cfg, db, venue.clone()).unwrap();

        let outcome = run.run_backtest(&History(sawtooth(2)), rx).await.unwrap();
        let BacktestOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert!(venue.1.load(Ordering::SeqCst) > 0, "signals fired");
        assert_eq!(report.total_trades, 0);
        assert!(run.ledger.transactions().await.unwrap().is_empty());
        assert!(run.machine().position().is_none());
    }

    #[tokio::test]
    async fn backtest_survives_closed_database() {
        let cfg = config();
        let db = store::open_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
        db.close().await;

        let outcome = run.run_backtest(&History(sawtooth(2)), rx).await.unwrap();
        let BacktestOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert!(!run.journal.is_empty(), "trading continued without the database");
        assert_eq!(report, score(&run.journal, &cfg.scoring, cfg.backtest.initial_base));
    }

    #[tokio::test]
    async fn empty_history_is_a_data_gap() {
        let cfg = config();
        let db = store::open_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.backtest_key(), &cfg, db, paper(&cfg)).unwrap();
        assert!(matches!(
            run.run_backtest(&History(Vec::new()), rx).await,
            Err(Error::DataGap { .. })
        ));
    }

    #[tokio::test]
    async fn live_run_trades_and_checkpoints_window() {
        let cfg = config();
        let candles = sawtooth(2);
        let (seed, rest) = candles.split_at(40);
        let (feed, tx) = Feed::new(seed.to_vec());

        let db = store::open_in_memory().await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.live_key(), &cfg, db.clone(), paper(&cfg)).unwrap();

        let rest = rest.to_vec();
        let producer = tokio::spawn(async move {
            for c in rest {
                // provisional update first, then the final candle, then a replay
                tx.send(Candle { is_final: false, ..c }).await.unwrap();
                tx.send(c).await.unwrap();
                tx.send(c).await.unwrap();
            }
        });

        run.run_live(&feed, shutdown_rx).await.unwrap();
        producer.await.unwrap();

        let txs = run.ledger.transactions().await.unwrap();
        assert!(!txs.is_empty());
        assert_eq!(txs[0].side, OrderSide::Buy);
        assert!(txs.iter().all(|t| candles.iter().any(|c| c.close_time == t.cursor)));

        let cp = CheckpointStore::new(db).load(&cfg.live_key()).await.unwrap().unwrap();
        let last = candles.last().unwrap();
        assert_eq!(cp.cursor, last.close_time);
        assert_eq!(cp.window.len(), cfg.live.window_capacity);
        assert_eq!(cp.window.last().unwrap().close_time, last.close_time);
        assert_eq!(cp.position, run.machine().position().cloned());
        assert!(!cp.completed);
    }

    #[tokio::test]
    async fn live_resume_catches_up_on_candles_missed_while_down() {
        let cfg = config();
        let candles = sawtooth(1);
        let db = store::open_in_memory().await.unwrap();

        let (feed, tx) = Feed::new(candles[..60].to_vec());
        drop(tx);
        let (_s, rx) = watch::channel(false);
        let mut first = RunContext::new(cfg.live_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
        first.run_live(&feed, rx).await.unwrap();
        assert_eq!(first.window().len(), 60);

        // candles 60..99 closed while the process was down
        let (feed, tx) = Feed::new(candles[..100].to_vec());
        tx.send(candles[99]).await.unwrap();
        tx.send(candles[100]).await.unwrap();
        drop(tx);
        let (_s, rx) = watch::channel(false);
        let mut second = RunContext::new(cfg.live_key(), &cfg, db.clone(), paper(&cfg)).unwrap();
        second.run_live(&feed, rx).await.unwrap();

        assert_eq!(feed.recent_calls.load(Ordering::SeqCst), 1);
        let window = second.window().snapshot();
        assert_eq!(window.len(), cfg.live.window_capacity);
        assert_eq!(window.first().unwrap().close_time, candles[1].close_time);
        assert_eq!(window.last().unwrap().close_time, candles[100].close_time);
        assert!(window.windows(2).all(|w| w[1].close_time - w[0].close_time == FIVE_MINUTES));

        let cp = CheckpointStore::new(db).load(&cfg.live_key()).await.unwrap().unwrap();
        assert_eq!(cp.cursor, candles[100].close_time);
        assert_eq!(cp.window, window);
    }

    #[tokio::test]
    async fn live_run_stops_on_shutdown() {
        let cfg = config();
        let (feed, tx) = Feed::new(Vec::new());
        let db = store::open_in_memory().await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut run = RunContext::new(cfg.live_key(), &cfg, db.clone(), paper(&cfg)).unwrap();

        tx.send(candle(0, 100.0)).await.unwrap();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            shutdown_tx.send(true).unwrap();
            // keep the feed open past shutdown
            tx
        });

        run.run_live(&feed, shutdown_rx).await.unwrap();
        let _tx = stopper.await.unwrap();

        let cp = CheckpointStore::new(db).load(&cfg.live_key()).await.unwrap().unwrap();
        assert_eq!(cp.window.len(), 1);
        assert_eq!(cp.cursor, candle(0, 100.0).close_time);
    }
}
