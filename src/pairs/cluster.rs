use crate::config::PairBotConfig;
use crate::stats::{mean_std, symmetric_eigen};
use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

/// Characteristics matrix: one row per instrument, one column per feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub symbols: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = std::fs::File::open(path_ref)
            .with_context(|| format!("failed to open features {}", path_ref.display()))?;
        Self::from_csv_reader(file)
            .with_context(|| format!("failed to parse features {}", path_ref.display()))
    }

    /// First column is the symbol, the header row names the features.
    /// Cells that do not parse as numbers become NaN.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let columns: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

        let mut symbols = Vec::new();
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let Some(symbol) = record.get(0).map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let values: Vec<f64> = record
                .iter()
                .skip(1)
                .map(|cell| cell.trim().parse::<f64>().unwrap_or(f64::NAN))
                .collect();
            symbols.push(symbol.to_string());
            rows.push(values);
        }
        Ok(Self {
            symbols,
            columns,
            rows,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn without_symbols(&self, excluded: &HashSet<String>) -> Self {
        let (symbols, rows) = self
            .symbols
            .iter()
            .zip(&self.rows)
            .filter(|(symbol, _)| !excluded.contains(*symbol))
            .map(|(symbol, row)| (symbol.clone(), row.clone()))
            .unzip();
        Self {
            symbols,
            columns: self.columns.clone(),
            rows,
        }
    }

    fn drop_incomplete_rows(&self) -> Self {
        let mut symbols = Vec::new();
        let mut rows = Vec::new();
        for (symbol, row) in self.symbols.iter().zip(&self.rows) {
            if row.iter().all(|v| v.is_finite()) {
                symbols.push(symbol.clone());
                rows.push(row.clone());
            } else {
                log::warn!("[CLUSTER] dropping {}: non-finite characteristics", symbol);
            }
        }
        Self {
            symbols,
            columns: self.columns.clone(),
            rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub symbol: String,
    pub cluster_id: usize,
    pub momentum: f64,
}

#[derive(Debug, Clone)]
pub struct FeatureClusterer {
    variance_fraction: f64,
    distance_threshold: f64,
    momentum_column: String,
}

impl FeatureClusterer {
    pub fn new(
        variance_fraction: f64,
        distance_threshold: f64,
        momentum_column: impl Into<String>,
    ) -> Self {
        Self {
            variance_fraction,
            distance_threshold,
            momentum_column: momentum_column.into(),
        }
    }

    pub fn from_config(cfg: &PairBotConfig) -> Self {
        Self::new(
            cfg.pca_variance,
            cfg.cluster_distance_threshold,
            cfg.momentum_column.clone(),
        )
    }

    pub fn fit(&self, matrix: &FeatureMatrix) -> Result<Vec<ClusterAssignment>> {
        let momentum_idx = matrix
            .column_index(&self.momentum_column)
            .ok_or_else(|| anyhow!("momentum column '{}' missing", self.momentum_column))?;
        if matrix.columns.is_empty() {
            return Err(anyhow!("degenerate input: no feature columns"));
        }
        let usable = matrix.drop_incomplete_rows();
        if usable.rows.len() < 2 {
            return Err(anyhow!(
                "degenerate input: {} usable rows, need at least 2",
                usable.rows.len()
            ));
        }

        let standardized = standardize_columns(&usable.rows);
        let projected = pca_project(&standardized, self.variance_fraction)?;
        let labels = agglomerate_average_cosine(&projected, self.distance_threshold);

        let cluster_count = labels.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        log::info!(
            "[CLUSTER] {} instruments, {} components, {} clusters",
            usable.rows.len(),
            projected.first().map(|r| r.len()).unwrap_or(0),
            cluster_count
        );

        Ok(usable
            .symbols
            .iter()
            .zip(&usable.rows)
            .zip(labels)
            .map(|((symbol, row), cluster_id)| ClusterAssignment {
                symbol: symbol.clone(),
                cluster_id,
                momentum: row[momentum_idx],
            })
            .collect())
    }
}

/// Zero mean, unit population variance per column; constant columns become 0.
pub fn standardize_columns(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut out = vec![vec![0.0; width]; rows.len()];
    for col in 0..width {
        let column: Vec<f64> = rows.iter().map(|r| r[col]).collect();
        let Some((mean, std)) = mean_std(&column) else {
            continue;
        };
        if std < 1e-12 {
            continue;
        }
        for (row, value) in out.iter_mut().zip(&column) {
            row[col] = (value - mean) / std;
        }
    }
    out
}

/// Projects centered rows onto the fewest principal components whose
/// cumulative explained variance exceeds `variance_fraction`.
pub fn pca_project(rows: &[Vec<f64>], variance_fraction: f64) -> Result<Vec<Vec<f64>>> {
    let n = rows.len();
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    if n < 2 || width == 0 {
        return Err(anyhow!("degenerate input: {}x{} matrix", n, width));
    }

    let means: Vec<f64> = (0..width)
        .map(|c| rows.iter().map(|r| r[c]).sum::<f64>() / n as f64)
        .collect();
    let mut cov = vec![vec![0.0; width]; width];
    for row in rows {
        for i in 0..width {
            let di = row[i] - means[i];
            for j in i..width {
                cov[i][j] += di * (row[j] - means[j]);
            }
        }
    }
    for i in 0..width {
        for j in i..width {
            cov[i][j] /= n as f64;
            cov[j][i] = cov[i][j];
        }
    }

    let (values, vectors) = symmetric_eigen(&cov);
    let values: Vec<f64> = values.into_iter().map(|v| v.max(0.0)).collect();
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return Err(anyhow!("degenerate input: all characteristics are constant"));
    }

    let mut kept = values.len();
    let mut cumulative = 0.0;
    for (idx, value) in values.iter().enumerate() {
        cumulative += value / total;
        if cumulative > variance_fraction {
            kept = idx + 1;
            break;
        }
    }

    Ok(rows
        .iter()
        .map(|row| {
            vectors[..kept]
                .iter()
                .map(|axis| {
                    axis.iter()
                        .zip(row.iter().zip(&means))
                        .map(|(w, (v, m))| w * (v - m))
                        .sum()
                })
                .collect()
        })
        .collect())
}

pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).max(0.0)
}

/// Average-linkage agglomerative clustering over cosine distance. Clusters
/// keep merging while the closest pair is strictly below `threshold`.
/// Labels are numbered by first appearance in `points`.
pub fn agglomerate_average_cosine(points: &[Vec<f64>], threshold: f64) -> Vec<usize> {
    let n = points.len();
    let mut dist = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = cosine_distance(&points[i], &points[j]);
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut size = vec![1usize; n];
    let mut active = vec![true; n];
    let mut owner: Vec<usize> = (0..n).collect();
    let nearest_of = |i: usize, dist: &Vec<Vec<f64>>, active: &Vec<bool>| -> Option<(usize, f64)> {
        (0..n)
            .filter(|&j| j != i && active[j])
            .map(|j| (j, dist[i][j]))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    };
    let mut nearest: Vec<Option<(usize, f64)>> =
        (0..n).map(|i| nearest_of(i, &dist, &active)).collect();

    loop {
        let best = (0..n)
            .filter(|&i| active[i])
            .filter_map(|i| nearest[i].map(|(j, d)| (i, j, d)))
            .min_by(|a, b| a.2.total_cmp(&b.2));
        let Some((keep, absorb, d)) = best else {
            break;
        };
        if d >= threshold {
            break;
        }

        let (si, sj) = (size[keep] as f64, size[absorb] as f64);
        for k in 0..n {
            if !active[k] || k == keep || k == absorb {
                continue;
            }
            let merged = (si * dist[keep][k] + sj * dist[absorb][k]) / (si + sj);
            dist[keep][k] = merged;
            dist[k][keep] = merged;
        }
        size[keep] += size[absorb];
        active[absorb] = false;
        for o in owner.iter_mut() {
            if *o == absorb {
                *o = keep;
            }
        }

        nearest[absorb] = None;
        nearest[keep] = nearest_of(keep, &dist, &active);
        for k in 0..n {
            if !active[k] || k == keep {
                continue;
            }
            match nearest[k] {
                Some((j, _)) if j == keep || j == absorb => {
                    nearest[k] = nearest_of(k, &dist, &active);
                }
                Some((_, current)) if dist[k][keep] < current => {
                    nearest[k] = Some((keep, dist[k][keep]));
                }
                _ => {}
            }
        }
    }

    let mut label_of: HashMap<usize, usize> = HashMap::new();
    owner
        .iter()
        .map(|root| {
            let next = label_of.len();
            *label_of.entry(*root).or_insert(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEATURES: &str = "\
symbol,m0,m47,pe,pb
AAA,0.10,0.30,12.0,1.1
AAB,0.11,0.10,12.5,1.2
AAC,0.09,0.05,11.8,1.0
BBA,-0.20,-0.20,40.0,6.0
BBB,-0.22,0.12,41.0,6.2
";

    #[test]
    fn parses_csv_and_maps_bad_cells_to_nan() {
        let csv = "symbol,m47,pe\nAAA,0.1,abc\nBBB,0.2,3\n";
        let matrix = FeatureMatrix::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(matrix.symbols, vec!["AAA", "BBB"]);
        assert_eq!(matrix.columns, vec!["m47", "pe"]);
        assert!(matrix.rows[0][1].is_nan());
        assert_eq!(matrix.column_index("pe"), Some(1));
    }

    #[test]
    fn standardize_maps_constant_columns_to_zero() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let out = standardize_columns(&rows);
        assert_eq!(out, vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn pca_keeps_single_component_for_rank_one_data() {
        let rows: Vec<Vec<f64>> = (0..6)
            .map(|i| {
                let t = i as f64;
                vec![t, 2.0 * t, -t]
            })
            .collect();
        let projected = pca_project(&standardize_columns(&rows), 0.99).unwrap();
        assert_eq!(projected[0].len(), 1);
    }

    #[test]
    fn cosine_distance_handles_zero_vectors() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert!(cosine_distance(&[1.0, 1.0], &[2.0, 2.0]).abs() < 1e-12);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn agglomeration_stops_at_threshold() {
        let points = vec![
            vec![1.0, 0.0],
            vec![0.99, 0.05],
            vec![0.0, 1.0],
            vec![0.05, 0.98],
        ];
        let labels = agglomerate_average_cosine(&points, 0.3);
        assert_eq!(labels, vec![0, 0, 1, 1]);
        let singletons = agglomerate_average_cosine(&points, 0.0);
        assert_eq!(singletons, vec![0, 1, 2, 3]);
        let everything = agglomerate_average_cosine(&points, 2.5);
        assert_eq!(everything, vec![0, 0, 0, 0]);
    }

    #[test]
    fn fit_annotates_raw_momentum_and_excludes_symbols() {
        let matrix = FeatureMatrix::from_csv_reader(FEATURES.as_bytes()).unwrap();
        let excluded: HashSet<String> = ["BBB".to_string()].into_iter().collect();
        let clusterer = FeatureClusterer::new(0.99, 0.3, "m47");
        let assignments = clusterer.fit(&matrix.without_symbols(&excluded)).unwrap();
        assert_eq!(assignments.len(), 4);
        assert!(assignments.iter().all(|a| a.symbol != "BBB"));
        let aaa = assignments.iter().find(|a| a.symbol == "AAA").unwrap();
        assert_eq!(aaa.momentum, 0.30);
    }

    #[test]
    fn fit_rejects_degenerate_input() {
        let matrix = FeatureMatrix::from_csv_reader("symbol,m47\nAAA,0.1\n".as_bytes()).unwrap();
        let clusterer = FeatureClusterer::new(0.99, 0.3, "m47");
        assert!(clusterer.fit(&matrix).is_err());

        let missing = FeatureMatrix::from_csv_reader("symbol,pe\nAAA,1\nBBB,2\n".as_bytes()).unwrap();
        assert!(clusterer.fit(&missing).is_err());
    }
}
