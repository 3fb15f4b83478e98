use super::{SpreadModel, SpreadSignal};
use crate::pairs::cointegration::align_tail;
use crate::stats::{mean_std, zscore};

#[derive(Debug, Clone)]
pub struct RatioZScore {
    window: usize,
    entry_z: f64,
}

impl RatioZScore {
    pub fn new(window: usize, entry_z: f64) -> Self {
        Self {
            window: window.max(2),
            entry_z,
        }
    }

    pub fn is_enterable(&self, z: f64) -> bool {
        z > self.entry_z
    }
}

/// Elementwise short/long over the common tail.
pub fn price_ratio(short_leg: &[f64], long_leg: &[f64]) -> Option<Vec<f64>> {
    let (s, l) = align_tail(short_leg, long_leg);
    s.iter()
        .zip(l)
        .map(|(a, b)| {
            let r = a / b;
            (*b > 0.0 && r.is_finite()).then_some(r)
        })
        .collect()
}

impl SpreadModel for RatioZScore {
    fn name(&self) -> &'static str {
        "ratio"
    }

    fn evaluate(&self, short_leg: &[f64], long_leg: &[f64]) -> Option<SpreadSignal> {
        let ratios = price_ratio(short_leg, long_leg)?;
        if ratios.len() < 2 {
            return None;
        }
        let window = &ratios[ratios.len().saturating_sub(self.window)..];
        let (mean, std) = mean_std(window)?;
        let latest = *window.last()?;
        let z = zscore(latest, mean, std)?;
        Some(SpreadSignal {
            value: z,
            reference: mean,
            enter: self.is_enterable(z),
            exit: latest <= mean,
        })
    }

    /// The pair closes once the ratio is back at or below the mean it was
    /// opened against.
    fn should_exit(&self, entry_reference: f64, short_leg: &[f64], long_leg: &[f64]) -> Option<bool> {
        let latest = *price_ratio(short_leg, long_leg)?.last()?;
        Some(latest <= entry_reference)
    }
}
