use crate::config::{PairBotConfig, SignalModelKind};

pub mod kalman;
pub mod ou;
pub mod ratio;

pub use kalman::KalmanSpread;
pub use ou::OuOptimalStopping;
pub use ratio::RatioZScore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadSignal {
    /// z-score for the ratio and kalman models, portfolio value for ou.
    pub value: f64,
    /// Stored with the open pair and handed back to `should_exit`.
    pub reference: f64,
    pub enter: bool,
    pub exit: bool,
}

/// A model turning the close history of a (short, long) pair into an
/// entry/exit decision. `None` means the signal is unavailable this cycle.
pub trait SpreadModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, short_leg: &[f64], long_leg: &[f64]) -> Option<SpreadSignal>;

    fn should_exit(&self, entry_reference: f64, short_leg: &[f64], long_leg: &[f64]) -> Option<bool> {
        let _ = entry_reference;
        self.evaluate(short_leg, long_leg).map(|signal| signal.exit)
    }
}

pub fn build_model(cfg: &PairBotConfig) -> Box<dyn SpreadModel> {
    match cfg.signal_model {
        SignalModelKind::Ratio => Box::new(RatioZScore::new(cfg.ratio_window, cfg.entry_z)),
        SignalModelKind::Kalman => Box::new(KalmanSpread::new(cfg.entry_z, cfg.exit_z)),
        SignalModelKind::Ou => Box::new(OuOptimalStopping::new(
            cfg.ou_rate,
            cfg.ou_cost,
            cfg.ou_trading_days,
            cfg.ou_alloc_steps,
        )),
    }
}
