use crate::config::PairBotConfig;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Shares that can be shorted for `notional` at `bid`: whole round lots plus
/// the odd-lot remainder only when it reaches `odd_lot_min`.
pub fn shortable_qty(bid: Decimal, notional: Decimal, lot_size: Decimal, odd_lot_min: Decimal) -> Decimal {
    if bid <= Decimal::ZERO || notional <= Decimal::ZERO || lot_size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = (notional / bid).floor();
    let lots = (raw / lot_size).floor() * lot_size;
    let odd = raw % lot_size;
    if odd >= odd_lot_min {
        lots + odd
    } else {
        lots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingDecision {
    pub trade_count: usize,
    pub notional_per_trade: Decimal,
}

impl SizingDecision {
    pub fn none() -> Self {
        Self {
            trade_count: 0,
            notional_per_trade: Decimal::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trade_count == 0
    }
}

/// Book state the sizer needs besides the candidate quotes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookExposure {
    pub open_pairs: usize,
    pub open_positions: usize,
    /// Entry notional summed over every open position.
    pub existing_notional: Decimal,
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    max_positions: usize,
    min_viable_pairs: usize,
    lot_size: Decimal,
    odd_lot_min: Decimal,
}

impl PositionSizer {
    pub fn new(max_positions: usize, min_viable_pairs: usize, lot_size: Decimal, odd_lot_min: Decimal) -> Self {
        Self {
            max_positions,
            min_viable_pairs,
            lot_size,
            odd_lot_min,
        }
    }

    pub fn from_config(cfg: &PairBotConfig) -> Self {
        Self::new(cfg.max_positions, cfg.min_viable_pairs, cfg.lot_size, cfg.odd_lot_min)
    }

    pub fn shortable_qty(&self, bid: Decimal, notional: Decimal) -> Decimal {
        shortable_qty(bid, notional, self.lot_size, self.odd_lot_min)
    }

    /// Cash left for new pairs after keeping the entry budget split across
    /// both legs and netting what is already deployed.
    pub fn available_cash(equity: Decimal, cash: Decimal, entry_percent: Decimal) -> Decimal {
        equity * entry_percent / Decimal::from(2) - (equity - cash)
    }

    fn viable_count(&self, short_bids: &[Decimal], notional: Decimal) -> usize {
        short_bids
            .iter()
            .filter(|bid| self.shortable_qty(**bid, notional) > Decimal::ZERO)
            .count()
    }

    /// `short_bids` holds the short-leg bid of every tradable pair, best first.
    pub fn size(&self, short_bids: &[Decimal], available_cash: Decimal, book: BookExposure) -> SizingDecision {
        let pairs = short_bids.len();
        if pairs == 0 || available_cash <= Decimal::ZERO {
            return SizingDecision::none();
        }
        let headroom = self.max_positions.saturating_sub(book.open_pairs);

        let decision = if book.open_positions == 0 {
            let mut n = pairs.min(headroom);
            let mut avg = per_trade(available_cash, n);
            while n > 0 && self.viable_count(short_bids, avg) < n {
                n -= 1;
                avg = per_trade(available_cash, n);
            }
            if n == 0 || n < self.min_viable_pairs {
                log::info!(
                    "[SIZING] only {} viable pairs, below floor {}",
                    n,
                    self.min_viable_pairs
                );
                return SizingDecision::none();
            }
            SizingDecision {
                trade_count: n,
                notional_per_trade: avg,
            }
        } else {
            let avg = per_trade(book.existing_notional + available_cash, self.max_positions);
            if avg <= Decimal::ZERO {
                return SizingDecision::none();
            }
            let affordable = (available_cash / avg).floor().to_usize().unwrap_or(0);
            let n = affordable
                .min(self.viable_count(short_bids, avg))
                .min(headroom)
                .min(pairs);
            SizingDecision {
                trade_count: n,
                notional_per_trade: if n == 0 { Decimal::ZERO } else { avg },
            }
        };

        log::info!(
            "[SIZING] cash={} pairs={} open_pairs={} -> {} trades of {}",
            available_cash,
            pairs,
            book.open_pairs,
            decision.trade_count,
            decision.notional_per_trade
        );
        decision
    }
}

fn per_trade(cash: Decimal, count: usize) -> Decimal {
    if count == 0 {
        return Decimal::ZERO;
    }
    (cash / Decimal::from(count)).round_dp_with_strategy(2, RoundingStrategy::ToZero)
}
