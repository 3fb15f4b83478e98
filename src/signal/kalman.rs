use super::{SpreadModel, SpreadSignal};
use crate::pairs::cointegration::align_tail;
use crate::stats::{mean_sample_std, ols, zscore};

const SMOOTH_OBSERVATION_VAR: f64 = 1.0;
const SMOOTH_TRANSITION_VAR: f64 = 0.01;
const REGRESSION_OBSERVATION_VAR: f64 = 2.0;
const REGRESSION_DELTA: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct KalmanSpread {
    entry_z: f64,
    exit_z: f64,
}

impl KalmanSpread {
    pub fn new(entry_z: f64, exit_z: f64) -> Self {
        Self { entry_z, exit_z }
    }

    /// Spread of the pair under the filtered hedge ratio: long + hr * short.
    /// It rises when the long leg gets rich against the short leg, so a
    /// positive z reads as the long leg being the expensive one.
    pub fn spread(short_leg: &[f64], long_leg: &[f64]) -> Option<Vec<f64>> {
        let (short_leg, long_leg) = align_tail(short_leg, long_leg);
        if short_leg.len() < 3 || !short_leg.iter().chain(long_leg).all(|v| v.is_finite()) {
            return None;
        }
        let smoothed_short = kalman_average(short_leg);
        let smoothed_long = kalman_average(long_leg);
        let states = kalman_regression(&smoothed_short, &smoothed_long);
        let spread: Vec<f64> = states
            .iter()
            .zip(short_leg.iter().zip(long_leg))
            .map(|([beta, _alpha], (s, l))| l + (-beta) * s)
            .collect();
        spread.iter().all(|v| v.is_finite()).then_some(spread)
    }
}

/// Random-walk filter over a single series (mean starts at 0, variance 1).
pub fn kalman_average(observations: &[f64]) -> Vec<f64> {
    let mut mean = 0.0;
    let mut var = 1.0;
    let mut out = Vec::with_capacity(observations.len());
    for (t, &obs) in observations.iter().enumerate() {
        if t > 0 {
            var += SMOOTH_TRANSITION_VAR;
        }
        let gain = var / (var + SMOOTH_OBSERVATION_VAR);
        mean += gain * (obs - mean);
        var *= 1.0 - gain;
        out.push(mean);
    }
    out
}

/// Online regression `y = beta * x + alpha` with a random-walk state.
/// Returns the filtered `[beta, alpha]` after each observation.
pub fn kalman_regression(x: &[f64], y: &[f64]) -> Vec<[f64; 2]> {
    let q = REGRESSION_DELTA / (1.0 - REGRESSION_DELTA);
    let mut m = [0.0, 0.0];
    let mut p = [[1.0, 1.0], [1.0, 1.0]];
    let mut out = Vec::with_capacity(x.len().min(y.len()));

    for (t, (&xt, &yt)) in x.iter().zip(y).enumerate() {
        if t > 0 {
            p[0][0] += q;
            p[1][1] += q;
        }
        let h = [xt, 1.0];
        let ph = [
            p[0][0] * h[0] + p[0][1] * h[1],
            p[1][0] * h[0] + p[1][1] * h[1],
        ];
        let s = h[0] * ph[0] + h[1] * ph[1] + REGRESSION_OBSERVATION_VAR;
        let k = [ph[0] / s, ph[1] / s];
        let innovation = yt - (h[0] * m[0] + h[1] * m[1]);
        m = [m[0] + k[0] * innovation, m[1] + k[1] * innovation];

        // P = (I - K H) P, with H P = ph^T since P is symmetric
        p = [
            [p[0][0] - k[0] * ph[0], p[0][1] - k[0] * ph[1]],
            [p[1][0] - k[1] * ph[0], p[1][1] - k[1] * ph[1]],
        ];
        out.push(m);
    }
    out
}

/// Mean-reversion half-life in bars from an AR(1) fit of the spread changes.
pub fn half_life(spread: &[f64]) -> Option<usize> {
    if spread.len() < 3 {
        return None;
    }
    let mut lag: Vec<f64> = Vec::with_capacity(spread.len());
    lag.push(spread[0]);
    lag.extend_from_slice(&spread[..spread.len() - 1]);
    let mut ret: Vec<f64> = spread.iter().zip(&lag).map(|(s, l)| s - l).collect();
    ret[0] = ret[1];

    let fit = ols(&[vec![1.0; lag.len()], lag], &ret)?;
    let slope = fit.coef[1];
    if !slope.is_finite() || slope.abs() < 1e-12 {
        return None;
    }
    let hl = (-std::f64::consts::LN_2 / slope).round();
    Some(if hl.is_finite() && hl >= 1.0 { hl as usize } else { 1 })
}

impl SpreadModel for KalmanSpread {
    fn name(&self) -> &'static str {
        "kalman"
    }

    fn evaluate(&self, short_leg: &[f64], long_leg: &[f64]) -> Option<SpreadSignal> {
        let spread = Self::spread(short_leg, long_leg)?;
        let window = half_life(&spread)?.max(2);
        if window > spread.len() {
            return None;
        }
        let tail = &spread[spread.len() - window..];
        let (mean, std) = mean_sample_std(tail)?;
        let z = zscore(*tail.last()?, mean, std)?;
        Some(SpreadSignal {
            value: z,
            reference: mean,
            enter: z > self.entry_z,
            exit: z < self.exit_z,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_smoothing_step_has_no_prediction() {
        let out = kalman_average(&[10.0, 10.0]);
        assert!((out[0] - 5.0).abs() < 1e-12);
        // var after t0 = 0.5, predicted 0.51, gain 0.51 / 1.51
        let expected = 5.0 + (0.51 / 1.51) * 5.0;
        assert!((out[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn regression_tracks_fixed_relationship() {
        let x: Vec<f64> = (0..400).map(|i| 50.0 + (i as f64 * 0.1).sin() * 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 5.0).collect();
        let states = kalman_regression(&x, &y);
        let [beta, alpha] = states[states.len() - 1];
        assert!((beta * 50.0 + alpha - (2.0 * 50.0 + 5.0)).abs() < 2.0);
        assert!(beta > 1.5 && beta < 2.5);
    }

    #[test]
    fn half_life_of_ar1_decay() {
        // s_t = 0.5 * s_{t-1} alternating impulse keeps the fit well posed
        let mut spread = vec![8.0];
        for i in 1..60 {
            let prev = spread[i - 1];
            let shock = if i % 7 == 0 { 8.0 } else { 0.0 };
            spread.push(0.5 * prev + shock);
        }
        let hl = half_life(&spread).unwrap();
        assert!(hl >= 1 && hl <= 2, "half life {}", hl);
    }

    #[test]
    fn trending_spread_floors_half_life_at_one() {
        let spread: Vec<f64> = (0..30).map(|i| (i as f64).powf(1.5)).collect();
        assert_eq!(half_life(&spread), Some(1));
    }

    #[test]
    fn signal_unavailable_on_short_or_bad_input() {
        let model = KalmanSpread::new(1.0, 0.0);
        assert!(model.evaluate(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(model.evaluate(&[1.0, f64::NAN, 2.0, 3.0], &[1.0, 2.0, 3.0, 4.0]).is_none());
    }

    #[test]
    fn evaluates_oscillating_pair() {
        let short: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 3.0).collect();
        let long: Vec<f64> = (0..60)
            .map(|i| 50.0 + (i as f64 * 0.3).cos() * 2.0 + i as f64 * 0.01)
            .collect();
        let signal = KalmanSpread::new(1.0, 0.0).evaluate(&short, &long).unwrap();
        assert!(signal.value.is_finite());
        assert_eq!(signal.enter, signal.value > 1.0);
        assert_eq!(signal.exit, signal.value < 0.0);
    }

    #[test]
    fn z_follows_the_long_leg() {
        let short: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 3.0).collect();
        let long: Vec<f64> = (0..60).map(|i| 50.0 + (i as f64 * 0.3).cos() * 2.0).collect();
        let model = KalmanSpread::new(1.0, 0.0);

        let mut rich = long.clone();
        rich[59] *= 3.0;
        assert!(model.evaluate(&short, &rich).unwrap().value > 0.0);

        let mut cheap = long;
        cheap[59] /= 3.0;
        assert!(model.evaluate(&short, &cheap).unwrap().value < 0.0);
    }
}
