use common::{OrderSide, RunReport, Transaction};

use crate::config::ScoringConfig;

/// Score a ledger by pairing each transaction with the one after it.
///
/// Adjacent entries with opposite sides form a round-trip regardless of which
/// position they belong to, so one transaction can take part in two
/// round-trips. A BUY-first pair wins when price rose, a SELL-first pair wins
/// when it fell. Winning magnitude is scaled by `reward_risk`; every
/// round-trip pays `fee_rate * (entry + exit)`.
///
/// `transactions` must already be in ledger order.
pub fn score(transactions: &[Transaction], cfg: &ScoringConfig, initial_base: f64) -> RunReport {
    let mut profit = 0.0;
    let mut wins = 0u32;
    let mut losses = 0u32;
    let mut base_balance = initial_base;

    for pair in transactions.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);
        if current.side == next.side {
            continue;
        }

        let delta = next.price - current.price;
        let is_win = match current.side {
            OrderSide::Buy => delta > 0.0,
            OrderSide::Sell => delta < 0.0,
        };
        let magnitude = if is_win {
            delta.abs() * cfg.reward_risk
        } else {
            delta.abs()
        };
        let fee = (current.price + next.price) * cfg.fee_rate;
        let trade_profit = if is_win { magnitude - fee } else { -magnitude - fee };

        profit += trade_profit;
        base_balance += trade_profit / next.price;

        if is_win {
            wins += 1;
        } else {
            losses += 1;
        }
    }

    let total_trades = wins + losses;
    let win_rate = if total_trades > 0 {
        wins as f64 / total_trades as f64 * 100.0
    } else {
        0.0
    };

    RunReport {
        total_trades,
        wins,
        losses,
        win_rate,
        total_profit: profit,
        initial_base_balance: initial_base,
        final_base_balance: base_balance,
    }
}
