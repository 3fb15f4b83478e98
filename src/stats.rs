use statrs::distribution::{ContinuousCDF, Normal};

const DEGENERATE_EPS: f64 = 1e-12;

/// Population mean and standard deviation.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().copied().sum::<f64>() / values.len() as f64;
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    Some((mean, var.sqrt()))
}

/// Mean and standard deviation with Bessel's correction.
pub fn mean_sample_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().copied().sum::<f64>() / values.len() as f64;
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (values.len() - 1) as f64;
    Some((mean, var.sqrt()))
}

pub fn zscore(value: f64, mean: f64, std: f64) -> Option<f64> {
    if !std.is_finite() || std < DEGENERATE_EPS {
        return None;
    }
    let z = (value - mean) / std;
    z.is_finite().then_some(z)
}

pub fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coef: Vec<f64>,
    pub std_err: Vec<f64>,
    pub rss: f64,
    pub nobs: usize,
}

impl OlsFit {
    pub fn t_value(&self, index: usize) -> Option<f64> {
        let se = *self.std_err.get(index)?;
        if !se.is_finite() || se <= 0.0 {
            return None;
        }
        let t = self.coef[index] / se;
        t.is_finite().then_some(t)
    }

    /// Akaike criterion up to a constant shared by fits on the same sample.
    pub fn aic(&self) -> f64 {
        let n = self.nobs as f64;
        n * (self.rss / n).ln() + 2.0 * self.coef.len() as f64
    }
}

/// Least squares of `y` on the given regressor columns. Callers add a column of
/// ones when they want an intercept.
pub fn ols(columns: &[Vec<f64>], y: &[f64]) -> Option<OlsFit> {
    let k = columns.len();
    let n = y.len();
    if k == 0 || n <= k || columns.iter().any(|c| c.len() != n) {
        return None;
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for i in 0..k {
        for j in i..k {
            let dot: f64 = columns[i].iter().zip(&columns[j]).map(|(a, b)| a * b).sum();
            xtx[i][j] = dot;
            xtx[j][i] = dot;
        }
        xty[i] = columns[i].iter().zip(y).map(|(a, b)| a * b).sum();
    }

    let inv = invert(xtx)?;
    let coef: Vec<f64> = (0..k)
        .map(|i| (0..k).map(|j| inv[i][j] * xty[j]).sum())
        .collect();

    let rss: f64 = (0..n)
        .map(|row| {
            let fitted: f64 = (0..k).map(|c| columns[c][row] * coef[c]).sum();
            let r = y[row] - fitted;
            r * r
        })
        .sum();
    let sigma2 = rss / (n - k) as f64;
    let std_err = (0..k).map(|i| (sigma2 * inv[i][i]).max(0.0).sqrt()).collect();

    if !all_finite(&coef) {
        return None;
    }
    Some(OlsFit {
        coef,
        std_err,
        rss,
        nobs: n,
    })
}

/// Gauss-Jordan inversion with partial pivoting.
pub fn invert(mut a: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot][col].abs() < DEGENERATE_EPS * scale {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..n {
            a[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

pub fn normal_cdf(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(dist) => dist.cdf(x),
        Err(_) => f64::NAN,
    }
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
/// Returns eigenvalues and the matching eigenvectors (as rows), sorted by
/// eigenvalue descending.
pub fn symmetric_eigen(matrix: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    let norm: f64 = a.iter().flat_map(|r| r.iter()).map(|x| x * x).sum();
    let tolerance = 1e-24 * norm.max(f64::MIN_POSITIVE);

    for _sweep in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p][q] * a[p][q])
            .sum();
        if off <= tolerance {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p][q];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
                let t = if theta == 0.0 {
                    1.0
                } else {
                    theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
                };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for row in a.iter_mut() {
                    let (akp, akq) = (row[p], row[q]);
                    row[p] = c * akp - s * akq;
                    row[q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[p][k], a[q][k]);
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let (vkp, vkq) = (row[p], row[q]);
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[j][j].total_cmp(&a[i][i]));
    let values = order.iter().map(|&i| a[i][i]).collect();
    let vectors = order
        .iter()
        .map(|&i| (0..n).map(|row| v[row][i]).collect())
        .collect();
    (values, vectors)
}
