use crate::config::PairBotConfig;
use crate::stats::{normal_cdf, ols};

// MacKinnon (1994) response surface, Engle-Granger with constant, two variables.
const TAU_MAX: f64 = 0.92;
const TAU_MIN: f64 = -18.86;
const TAU_STAR: f64 = -2.62;
const TAU_SMALLP: [f64; 3] = [2.92, 1.5012, 0.039796];
const TAU_LARGEP: [f64; 4] = [2.1945, 0.64695, -0.29198, -0.042377];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CointegrationResult {
    pub t_stat: f64,
    pub p_value: f64,
    pub lag: usize,
    pub hedge_beta: f64,
    pub nobs: usize,
}

#[derive(Debug, Clone)]
pub struct CointegrationFilter {
    significance: f64,
    max_lag: usize,
    min_overlap: usize,
}

impl CointegrationFilter {
    pub fn new(significance: f64, max_lag: usize, min_overlap: usize) -> Self {
        Self {
            significance,
            max_lag,
            min_overlap,
        }
    }

    pub fn from_config(cfg: &PairBotConfig) -> Self {
        Self::new(cfg.coint_significance, cfg.coint_max_lag, cfg.min_overlap)
    }

    /// Engle-Granger two-step test. `None` when the series are too short or
    /// numerically degenerate.
    pub fn test(&self, short_leg: &[f64], long_leg: &[f64]) -> Option<CointegrationResult> {
        let (y, x) = align_tail(short_leg, long_leg);
        if y.len() < self.min_overlap.max(self.max_lag + 4) {
            return None;
        }
        if !valid_prices(y) || !valid_prices(x) {
            return None;
        }

        let fit = ols(&[vec![1.0; x.len()], x.to_vec()], y)?;
        let (alpha, beta) = (fit.coef[0], fit.coef[1]);
        let residuals: Vec<f64> = y
            .iter()
            .zip(x)
            .map(|(yi, xi)| yi - alpha - beta * xi)
            .collect();

        let (t_stat, lag) = adf_no_constant(&residuals, self.max_lag)?;
        Some(CointegrationResult {
            t_stat,
            p_value: mackinnon_p_value(t_stat),
            lag,
            hedge_beta: beta,
            nobs: y.len(),
        })
    }

    pub fn accepts(&self, result: &CointegrationResult) -> bool {
        result.p_value < self.significance
    }
}

fn valid_prices(series: &[f64]) -> bool {
    series.iter().all(|p| p.is_finite() && *p > 0.0)
}

/// Trims both series to their common most recent stretch.
pub fn align_tail<'a>(a: &'a [f64], b: &'a [f64]) -> (&'a [f64], &'a [f64]) {
    let n = a.len().min(b.len());
    (&a[a.len() - n..], &b[b.len() - n..])
}

/// Augmented Dickey-Fuller without deterministic terms. The lag is picked by
/// AIC on a common sample, then the regression is refit on every usable row.
fn adf_no_constant(series: &[f64], max_lag: usize) -> Option<(f64, usize)> {
    let diffs: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.len() < max_lag + 3 {
        return None;
    }

    let mut best: Option<(f64, usize)> = None;
    for lag in 0..=max_lag {
        let fit = adf_regression(series, &diffs, lag, max_lag)?;
        let aic = fit.aic();
        if best.map(|(best_aic, _)| aic < best_aic).unwrap_or(true) {
            best = Some((aic, lag));
        }
    }
    let (_, lag) = best?;
    let fit = adf_regression(series, &diffs, lag, lag)?;
    Some((fit.t_value(0)?, lag))
}

fn adf_regression(
    series: &[f64],
    diffs: &[f64],
    lag: usize,
    first_row: usize,
) -> Option<crate::stats::OlsFit> {
    let rows = first_row..diffs.len();
    let mut columns = vec![rows.clone().map(|t| series[t]).collect::<Vec<f64>>()];
    for i in 1..=lag {
        columns.push(rows.clone().map(|t| diffs[t - i]).collect());
    }
    let y: Vec<f64> = rows.map(|t| diffs[t]).collect();
    ols(&columns, &y)
}

pub fn mackinnon_p_value(t_stat: f64) -> f64 {
    if t_stat > TAU_MAX {
        return 1.0;
    }
    if t_stat < TAU_MIN {
        return 0.0;
    }
    let coef: &[f64] = if t_stat <= TAU_STAR {
        &TAU_SMALLP
    } else {
        &TAU_LARGEP
    };
    let poly = coef
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * t_stat + c);
    normal_cdf(poly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_walk(rng: &mut StdRng, n: usize, start: f64) -> Vec<f64> {
        let mut level = start;
        (0..n)
            .map(|_| {
                level += rng.gen_range(-1.0..1.0);
                level
            })
            .collect()
    }

    #[test]
    fn mackinnon_matches_reference_points() {
        assert_eq!(mackinnon_p_value(1.5), 1.0);
        assert_eq!(mackinnon_p_value(-20.0), 0.0);
        assert!((mackinnon_p_value(-3.34) - 0.05).abs() < 0.003);
        let below = mackinnon_p_value(TAU_STAR - 1e-9);
        let above = mackinnon_p_value(TAU_STAR + 1e-9);
        assert!((below - above).abs() < 0.01);
    }

    #[test]
    fn cointegrated_pair_passes_gate() {
        let mut rng = StdRng::seed_from_u64(7);
        let long = random_walk(&mut rng, 250, 100.0);
        let short: Vec<f64> = long
            .iter()
            .map(|p| 1.5 * p + 10.0 + rng.gen_range(-0.5..0.5))
            .collect();
        let filter = CointegrationFilter::new(0.05, 1, 20);
        let result = filter.test(&short, &long).unwrap();
        assert!(result.p_value < 0.01, "p = {}", result.p_value);
        assert!((result.hedge_beta - 1.5).abs() < 0.05);
        assert!(filter.accepts(&result));
    }

    #[test]
    fn independent_walks_mostly_fail_gate() {
        let filter = CointegrationFilter::new(0.05, 1, 20);
        let mut passed = 0;
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(1000 + seed);
            let a = random_walk(&mut rng, 250, 200.0);
            let b = random_walk(&mut rng, 250, 200.0);
            if let Some(result) = filter.test(&a, &b) {
                if filter.accepts(&result) {
                    assert!(result.p_value < 0.05);
                    passed += 1;
                }
            }
        }
        assert!(passed <= 5, "{} spurious passes", passed);
    }

    #[test]
    fn gate_never_accepts_at_or_above_significance() {
        let filter = CointegrationFilter::new(0.05, 1, 20);
        let edge = CointegrationResult {
            t_stat: -3.0,
            p_value: 0.05,
            lag: 0,
            hedge_beta: 1.0,
            nobs: 30,
        };
        assert!(!filter.accepts(&edge));
    }

    #[test]
    fn short_or_invalid_series_are_rejected() {
        let filter = CointegrationFilter::new(0.05, 1, 20);
        let short: Vec<f64> = (1..15).map(|i| i as f64).collect();
        assert!(filter.test(&short, &short).is_none());

        let mut with_zero: Vec<f64> = (1..40).map(|i| 10.0 + i as f64).collect();
        with_zero[5] = 0.0;
        let other: Vec<f64> = (1..40).map(|i| 20.0 + i as f64).collect();
        assert!(filter.test(&with_zero, &other).is_none());
    }

    #[test]
    fn align_tail_keeps_most_recent_overlap() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [30.0, 40.0];
        let (x, y) = align_tail(&a, &b);
        assert_eq!(x, &[3.0, 4.0]);
        assert_eq!(y, &[30.0, 40.0]);
    }
}
