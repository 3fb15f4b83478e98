use super::{SpreadModel, SpreadSignal};
use crate::pairs::cointegration::align_tail;

const MIN_OBSERVATIONS: usize = 10;
const SIMPSON_STEPS: usize = 2000;
const TAIL_WIDTH: f64 = 12.0;
const MAX_SCALED_ARG: f64 = 200.0;
const MAX_RATE_OVER_SPEED: f64 = 50.0;
const BRACKET_EXPANSIONS: usize = 60;
const BISECTION_ITERS: usize = 200;

/// Exact-likelihood fit of dX = mu (theta - X) dt + sigma dW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OuParams {
    pub theta: f64,
    pub mu: f64,
    pub sigma: f64,
    /// Average log-likelihood per transition.
    pub log_likelihood: f64,
}

pub fn fit_ou_mle(xs: &[f64], dt: f64) -> Option<OuParams> {
    if xs.len() < 3 || dt <= 0.0 {
        return None;
    }
    let prev = &xs[..xs.len() - 1];
    let next = &xs[1..];
    let n = prev.len() as f64;

    let sx: f64 = prev.iter().sum();
    let sy: f64 = next.iter().sum();
    let sxx: f64 = prev.iter().map(|x| x * x).sum();
    let sxy: f64 = prev.iter().zip(next).map(|(x, y)| x * y).sum();
    let syy: f64 = next.iter().map(|y| y * y).sum();

    let den = n * (sxx - sxy) - (sx * sx - sx * sy);
    if den.abs() < 1e-14 {
        return None;
    }
    let theta = (sy * sxx - sx * sxy) / den;

    let decay = (sxy - theta * sx - theta * sy + n * theta * theta)
        / (sxx - 2.0 * theta * sx + n * theta * theta);
    if !(decay > 0.0 && decay < 1.0) {
        return None;
    }
    let mu = -decay.ln() / dt;
    let alpha = (-mu * dt).exp();

    let sigma2 = 2.0 * mu / (n * (1.0 - alpha * alpha))
        * (syy - 2.0 * alpha * sxy + alpha * alpha * sxx
            - 2.0 * theta * (1.0 - alpha) * (sy - alpha * sx)
            + n * theta * theta * (1.0 - alpha) * (1.0 - alpha));
    if !(sigma2 > 0.0) {
        return None;
    }
    let step_var = sigma2 * (1.0 - (-2.0 * mu * dt).exp()) / (2.0 * mu);
    let sse: f64 = prev
        .iter()
        .zip(next)
        .map(|(x, y)| {
            let r = y - x * alpha - theta * (1.0 - alpha);
            r * r
        })
        .sum();
    let log_likelihood = -0.5 * (2.0 * std::f64::consts::PI).ln()
        - 0.5 * step_var.ln()
        - sse / (2.0 * n * step_var);

    let params = OuParams {
        theta,
        mu,
        sigma: sigma2.sqrt(),
        log_likelihood,
    };
    [params.theta, params.mu, params.sigma, params.log_likelihood]
        .iter()
        .all(|v| v.is_finite())
        .then_some(params)
}

/// Value of $1 of A against -$`alloc_b` of B, both normalized to the first bar.
pub fn portfolio_values(a: &[f64], b: &[f64], alloc_b: f64) -> Option<Vec<f64>> {
    let (a0, b0) = (*a.first()?, *b.first()?);
    if !(a0 > 0.0 && b0 > 0.0) {
        return None;
    }
    let values: Vec<f64> = a
        .iter()
        .zip(b)
        .map(|(pa, pb)| pa / a0 - alloc_b * pb / b0)
        .collect();
    values.iter().all(|v| v.is_finite()).then_some(values)
}

/// Grid search over `alloc_b` in (0, 1] for the best OU likelihood.
pub fn best_allocation(a: &[f64], b: &[f64], dt: f64, steps: usize) -> Option<(f64, OuParams)> {
    let steps = steps.max(1);
    let mut best: Option<(f64, OuParams)> = None;
    for i in 1..=steps {
        let alloc = i as f64 / steps as f64;
        let Some(params) = portfolio_values(a, b, alloc).and_then(|v| fit_ou_mle(&v, dt)) else {
            continue;
        };
        if best
            .map(|(_, current)| params.log_likelihood > current.log_likelihood)
            .unwrap_or(true)
        {
            best = Some((alloc, params));
        }
    }
    best
}

fn simpson<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, steps: usize) -> f64 {
    let steps = steps + steps % 2;
    let h = (b - a) / steps as f64;
    let mut acc = f(a) + f(b);
    for i in 1..steps {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        acc += weight * f(a + i as f64 * h);
    }
    acc * h / 3.0
}

/// `∫_0^∞ u^p exp(k u - u²/2) du` divided by `exp(m)`, `m = max(k, 0)² / 2`.
/// Returns the scaled value and `m`. Requires `p > -1`.
pub(crate) fn scaled_moment(p: f64, k: f64) -> (f64, f64) {
    let m = if k > 0.0 { k * k / 2.0 } else { 0.0 };
    let f = |u: f64| (k * u - u * u / 2.0 - m).exp();
    let f0 = f(0.0);

    let head = if p < 0.0 {
        simpson(
            |u| if u == 0.0 { 0.0 } else { u.powf(p) * (f(u) - f0) },
            0.0,
            1.0,
            SIMPSON_STEPS,
        ) + f0 / (p + 1.0)
    } else {
        simpson(|u| u.powf(p) * f(u), 0.0, 1.0, SIMPSON_STEPS)
    };

    let peak = (k + (k * k + 4.0 * p.max(0.0)).sqrt()) / 2.0;
    let upper = (peak + TAIL_WIDTH).max(2.0);
    let tail = simpson(|u| u.powf(p) * f(u), 1.0, upper, SIMPSON_STEPS);
    (head + tail, m)
}

/// Optimal entry and liquidation levels for a mean-reverting portfolio
/// under discount rate `r` and a fixed transaction cost `c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalStopping {
    pub params: OuParams,
    pub entry_level: f64,
    pub exit_level: f64,
}

struct Boundary {
    theta: f64,
    scale: f64,
    rate_ratio: f64,
    cost: f64,
}

impl Boundary {
    fn arg(&self, x: f64) -> f64 {
        self.scale * (x - self.theta)
    }

    /// (F, F', log scale) at x.
    fn f(&self, x: f64) -> Option<(f64, f64, f64)> {
        let k = self.arg(x);
        if k.abs() > MAX_SCALED_ARG {
            return None;
        }
        let (value, m) = scaled_moment(self.rate_ratio - 1.0, k);
        let (deriv, _) = scaled_moment(self.rate_ratio, k);
        Some((value, self.scale * deriv, m))
    }

    /// (G, G', log scale) at x.
    fn g(&self, x: f64) -> Option<(f64, f64, f64)> {
        let k = -self.arg(x);
        if k.abs() > MAX_SCALED_ARG {
            return None;
        }
        let (value, m) = scaled_moment(self.rate_ratio - 1.0, k);
        let (deriv, _) = scaled_moment(self.rate_ratio, k);
        Some((value, -self.scale * deriv, m))
    }

    fn exit_equation(&self, b: f64) -> Option<f64> {
        let (f, fp, _) = self.f(b)?;
        Some(f - (b - self.cost) * fp)
    }

    fn entry_equation(&self, d: f64, exit_level: f64) -> Option<f64> {
        let (fb, _, mb) = self.f(exit_level)?;
        let (fd, fpd, md) = self.f(d)?;
        let (gd, gpd, _) = self.g(d)?;
        let rescale = (md - mb).exp() / fb;
        let value = (exit_level - self.cost) * fd * rescale;
        let slope = (exit_level - self.cost) * fpd * rescale;
        Some(gd * (slope - 1.0) - gpd * (value - d - self.cost))
    }
}

/// Finds a sign change of `f` starting from `anchor`, stepping away in
/// `direction`, then bisects it.
fn bracket_and_bisect<F: Fn(f64) -> Option<f64>>(
    f: F,
    anchor: f64,
    step: f64,
    direction: f64,
) -> Option<f64> {
    let anchor_sign = f(anchor)?.signum();
    let mut width = step;
    let mut far = anchor + direction * width;
    let mut expansions = 0;
    while f(far)?.signum() == anchor_sign {
        expansions += 1;
        if expansions > BRACKET_EXPANSIONS {
            return None;
        }
        width *= 2.0;
        far = anchor + direction * width;
    }

    let (mut near, mut far) = (anchor, far);
    for _ in 0..BISECTION_ITERS {
        let mid = 0.5 * (near + far);
        if f(mid)?.signum() == anchor_sign {
            near = mid;
        } else {
            far = mid;
        }
        if (far - near).abs() <= 1e-12 * (1.0 + mid.abs()) {
            break;
        }
    }
    let root = 0.5 * (near + far);
    root.is_finite().then_some(root)
}

impl OptimalStopping {
    pub fn solve(params: &OuParams, rate: f64, cost: f64) -> Option<Self> {
        if !(params.mu > 0.0 && params.sigma > 0.0 && rate > 0.0) {
            return None;
        }
        let rate_ratio = rate / params.mu;
        if rate_ratio > MAX_RATE_OVER_SPEED {
            return None;
        }
        let boundary = Boundary {
            theta: params.theta,
            scale: (2.0 * params.mu).sqrt() / params.sigma,
            rate_ratio,
            cost,
        };
        let step = 1.0 / boundary.scale;

        let exit_level = bracket_and_bisect(|b| boundary.exit_equation(b), cost, step, 1.0)?;
        let entry_level = bracket_and_bisect(
            |d| boundary.entry_equation(d, exit_level),
            exit_level,
            step,
            -1.0,
        )?;
        (entry_level < exit_level).then_some(Self {
            params: *params,
            entry_level,
            exit_level,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OuOptimalStopping {
    rate: f64,
    cost: f64,
    trading_days: f64,
    alloc_steps: usize,
}

impl OuOptimalStopping {
    pub fn new(rate: f64, cost: f64, trading_days: f64, alloc_steps: usize) -> Self {
        Self {
            rate,
            cost,
            trading_days,
            alloc_steps,
        }
    }
}

impl SpreadModel for OuOptimalStopping {
    fn name(&self) -> &'static str {
        "ou"
    }

    /// The portfolio holds $1 of the long leg against -$allocB of the short
    /// leg, so a low value means the short leg is rich.
    fn evaluate(&self, short_leg: &[f64], long_leg: &[f64]) -> Option<SpreadSignal> {
        let (a, b) = align_tail(long_leg, short_leg);
        if a.len() < MIN_OBSERVATIONS || self.trading_days <= 0.0 {
            return None;
        }
        let dt = 1.0 / self.trading_days;
        let (alloc_b, params) = best_allocation(a, b, dt, self.alloc_steps)?;
        let stopping = match OptimalStopping::solve(&params, self.rate, self.cost) {
            Some(stopping) => stopping,
            None => {
                log::debug!(
                    "[SIGNAL] no optimal stopping levels for theta={:.4} mu={:.4} sigma={:.4}",
                    params.theta,
                    params.mu,
                    params.sigma
                );
                return None;
            }
        };
        let value = *portfolio_values(a, b, alloc_b)?.last()?;
        Some(SpreadSignal {
            value,
            reference: stopping.exit_level,
            enter: value <= stopping.entry_level,
            exit: value >= stopping.exit_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = rng.gen_range(1e-12..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn simulate(theta: f64, mu: f64, sigma: f64, dt: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let decay = (-mu * dt).exp();
        let step_sd = sigma * ((1.0 - decay * decay) / (2.0 * mu)).sqrt();
        let mut x = theta;
        (0..n)
            .map(|_| {
                x = theta + (x - theta) * decay + step_sd * gaussian(&mut rng);
                x
            })
            .collect()
    }

    #[test]
    fn mle_recovers_simulated_process() {
        let dt = 1.0 / 252.0;
        let path = simulate(0.5, 10.0, 0.3, dt, 2000, 42);
        let fit = fit_ou_mle(&path, dt).unwrap();
        assert!((fit.theta - 0.5).abs() < 0.05, "theta {}", fit.theta);
        assert!(fit.mu > 5.0 && fit.mu < 20.0, "mu {}", fit.mu);
        assert!((fit.sigma - 0.3).abs() < 0.03, "sigma {}", fit.sigma);
    }

    #[test]
    fn trending_series_has_no_fit() {
        let trend: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert!(fit_ou_mle(&trend, 1.0 / 252.0).is_none());
    }

    #[test]
    fn scaled_moment_matches_closed_forms() {
        let (v, m) = scaled_moment(0.0, 0.0);
        assert_eq!(m, 0.0);
        assert!((v - (std::f64::consts::PI / 2.0).sqrt()).abs() < 1e-6);

        let (v, _) = scaled_moment(-0.5, 0.0);
        assert!((v - 2.155_800).abs() < 1e-3, "{}", v);

        // e^{3u - u^2/2} = e^{4.5} e^{-(u-3)^2/2}
        let (v, m) = scaled_moment(0.0, 3.0);
        assert!((m - 4.5).abs() < 1e-12);
        assert!((v - 2.503_25).abs() < 1e-3, "{}", v);
    }

    #[test]
    fn optimal_levels_are_ordered() {
        let params = OuParams {
            theta: 0.5,
            mu: 8.0,
            sigma: 0.3,
            log_likelihood: 0.0,
        };
        let levels = OptimalStopping::solve(&params, 0.05, 0.05).unwrap();
        assert!(levels.exit_level > params.theta);
        assert!(levels.entry_level < levels.exit_level);
        assert!(levels.exit_level.is_finite() && levels.entry_level.is_finite());
    }

    #[test]
    fn allocation_grid_picks_mean_reverting_mix() {
        let dt = 1.0 / 252.0;
        let noise = simulate(0.0, 20.0, 0.2, dt, 300, 9);
        let b: Vec<f64> = (0..300).map(|i| 100.0 + (i as f64 * 0.05).sin() * 10.0).collect();
        // A tracks half of B's relative move plus a stationary residual
        let a: Vec<f64> = b
            .iter()
            .zip(&noise)
            .map(|(pb, e)| 50.0 * (1.0 + 0.5 * (pb / b[0] - 1.0) + 0.05 * e))
            .collect();
        let (alloc, params) = best_allocation(&a, &b, dt, 100).unwrap();
        assert!(alloc > 0.2 && alloc < 0.8, "alloc {}", alloc);
        assert!(params.mu > 0.0);
    }

    /// Long leg follows a smooth cycle; the short leg tracks it with a
    /// stationary relative residual.
    fn tracked_pair(n: usize) -> (Vec<f64>, Vec<f64>) {
        let dt = 1.0 / 252.0;
        let residual = simulate(0.0, 20.0, 0.03, dt, n, 11);
        let long_leg: Vec<f64> = (0..n)
            .map(|i| 100.0 + (i as f64 * 0.05).sin() * 10.0)
            .collect();
        let short_leg: Vec<f64> = long_leg
            .iter()
            .zip(&residual)
            .map(|(pl, e)| 50.0 * (pl / long_leg[0] - e + residual[0]))
            .collect();
        (short_leg, long_leg)
    }

    fn bump_last(series: &[f64], factor: f64) -> Vec<f64> {
        let mut bumped = series.to_vec();
        if let Some(last) = bumped.last_mut() {
            *last *= factor;
        }
        bumped
    }

    #[test]
    fn signal_matches_fitted_levels() {
        let model = OuOptimalStopping::new(0.05, 0.001, 252.0, 1);
        let (short_leg, long_leg) = tracked_pair(200);
        let signal = model.evaluate(&short_leg, &long_leg).unwrap();

        let dt = 1.0 / 252.0;
        let (alloc, params) = best_allocation(&long_leg, &short_leg, dt, 1).unwrap();
        let levels = OptimalStopping::solve(&params, 0.05, 0.001).unwrap();
        let value = *portfolio_values(&long_leg, &short_leg, alloc)
            .unwrap()
            .last()
            .unwrap();

        assert_eq!(signal.value, value);
        assert_eq!(signal.reference, levels.exit_level);
        assert_eq!(signal.enter, value <= levels.entry_level);
        assert_eq!(signal.exit, value >= levels.exit_level);
    }

    #[test]
    fn rich_short_leg_enters_and_cheap_short_leg_exits() {
        let model = OuOptimalStopping::new(0.05, 0.001, 252.0, 1);
        let (short_leg, long_leg) = tracked_pair(200);

        let popped = model
            .evaluate(&bump_last(&short_leg, 1.15), &long_leg)
            .unwrap();
        assert!(popped.enter, "value {}", popped.value);
        assert!(!popped.exit);

        let dipped = model
            .evaluate(&bump_last(&short_leg, 0.85), &long_leg)
            .unwrap();
        assert!(!dipped.enter, "value {}", dipped.value);
        assert!(dipped.exit);
    }

    #[test]
    fn degenerate_prices_give_no_signal() {
        let model = OuOptimalStopping::new(0.05, 0.05, 252.0, 100);
        assert!(model.evaluate(&[0.0; 30], &[1.0; 30]).is_none());
        assert!(model.evaluate(&[1.0; 5], &[1.0; 5]).is_none());
    }
}
