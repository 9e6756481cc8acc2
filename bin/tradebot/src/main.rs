use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{venue_mode, Config, Error, ExchangeClient, TradingMode};
use engine::{BacktestOutcome, BinanceClient, BinanceMarketData, Engine, RunOutcome};
use paper::PaperClient;
use strategy::StrategyFileConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path)
        .with_context(|| format!("loading {}", cfg.strategy_config_path))?;
    info!(
        run_mode = %cfg.run_mode,
        trading_mode = %cfg.trading_mode,
        pair = %strategy_file.instrument.symbol,
        interval = %strategy_file.instrument.interval,
        "TradeBot starting"
    );

    // ── Database ──────────────────────────────────────────────────────────────
    let db = store::open(&cfg.database_url)
        .await
        .context("opening database")?;

    // ── Exchange client (injected based on RUN_MODE and TRADING_MODE) ─────────
    let exchange_client: Arc<dyn ExchangeClient> = match venue_mode(cfg.run_mode, cfg.trading_mode) {
        TradingMode::Live => {
            info!("Live trading mode, using BinanceClient");
            Arc::new(BinanceClient::new(&cfg.binance_api_key, &cfg.binance_secret)?)
        }
        TradingMode::Paper => {
            info!(
                run_mode = %cfg.run_mode,
                slippage_bps = cfg.paper_slippage_bps,
                "Paper trading mode, using PaperClient"
            );
            Arc::new(PaperClient::new(
                strategy_file.instrument(),
                strategy_file.backtest.initial_base,
                strategy_file.backtest.initial_quote,
                cfg.paper_slippage_bps,
            ))
        }
    };
    let market_data = Arc::new(BinanceMarketData::new()?);

    // ── Engine ────────────────────────────────────────────────────────────────
    let (engine, handle) = Engine::new(strategy_file, db.clone(), exchange_client, market_data);

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                ctrl_c_handle.stop().await;
            }
            Err(e) => error!(error = %e, "Could not listen for ctrl-c"),
        }
    });

    let outcome = engine.run(cfg.run_mode).await;
    db.close().await;

    match outcome {
        Ok(RunOutcome::Backtest(BacktestOutcome::Completed(report))) => {
            info!(
                trades = report.total_trades,
                wins = report.wins,
                losses = report.losses,
                win_rate = report.win_rate,
                profit = report.total_profit,
                initial_base = report.initial_base_balance,
                final_base = report.final_base_balance,
                "Backtest report"
            );
        }
        Ok(RunOutcome::Backtest(BacktestOutcome::Interrupted { cursor })) => {
            info!(cursor, "Backtest interrupted, rerun to resume");
        }
        Ok(RunOutcome::LiveStopped) => info!("Live run stopped"),
        Err(Error::DataGap { pair, start_ms, end_ms }) => {
            warn!(%pair, start_ms, end_ms, "No market data for the requested period, nothing to do");
        }
        Err(e) => return Err(e).context(format!("{} run failed", cfg.run_mode)),
    }

    info!("Exiting");
    Ok(())
}
