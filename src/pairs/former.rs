use super::cluster::ClusterAssignment;
use super::PairKey;
use crate::config::PairBotConfig;
use crate::stats::mean_std;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub pair: PairKey,
    pub divergence: f64,
    pub divergence_z: f64,
}

#[derive(Debug, Clone)]
pub struct PairFormer {
    min_divergence_z: f64,
}

impl PairFormer {
    pub fn new(min_divergence_z: f64) -> Self {
        Self { min_divergence_z }
    }

    pub fn from_config(cfg: &PairBotConfig) -> Self {
        Self::new(cfg.min_divergence_z)
    }

    /// Every candidate of the run, ranked by divergence, with its z-score
    /// across the whole candidate set.
    pub fn rank_candidates(
        &self,
        assignments: &[ClusterAssignment],
        excluded: &HashSet<String>,
    ) -> Vec<CandidatePair> {
        let mut clusters: BTreeMap<usize, Vec<(&str, f64)>> = BTreeMap::new();
        for assignment in assignments {
            if excluded.contains(&assignment.symbol) {
                continue;
            }
            clusters
                .entry(assignment.cluster_id)
                .or_default()
                .push((assignment.symbol.as_str(), assignment.momentum));
        }

        let raw: Vec<(PairKey, f64)> = clusters
            .values()
            .flat_map(|members| pair_extremes(members))
            .collect();

        let divergences: Vec<f64> = raw.iter().map(|(_, d)| *d).collect();
        let (mean, std) = mean_std(&divergences).unwrap_or((0.0, 0.0));
        let mut ranked: Vec<CandidatePair> = raw
            .into_iter()
            .map(|(pair, divergence)| CandidatePair {
                pair,
                divergence,
                divergence_z: if std > 1e-12 {
                    (divergence - mean) / std
                } else {
                    0.0
                },
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.divergence
                .total_cmp(&a.divergence)
                .then_with(|| a.pair.cmp(&b.pair))
        });
        ranked
    }

    pub fn form_pairs(
        &self,
        assignments: &[ClusterAssignment],
        excluded: &HashSet<String>,
    ) -> Vec<CandidatePair> {
        let ranked = self.rank_candidates(assignments, excluded);
        let total = ranked.len();
        let kept: Vec<CandidatePair> = ranked
            .into_iter()
            .filter(|c| c.divergence_z > self.min_divergence_z)
            .collect();
        log::info!(
            "[TRAIN] {} candidate pairs, {} above divergence z {}",
            total,
            kept.len(),
            self.min_divergence_z
        );
        kept
    }
}

/// Two-pointer pairing inside one cluster: the strongest momentum is shorted
/// against the weakest, then inwards until the pointers meet.
pub fn pair_extremes(members: &[(&str, f64)]) -> Vec<(PairKey, f64)> {
    let mut sorted: Vec<(&str, f64)> = members.to_vec();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut pairs = Vec::with_capacity(sorted.len() / 2);
    if sorted.len() < 2 {
        return pairs;
    }
    let (mut head, mut tail) = (0, sorted.len() - 1);
    while head < tail {
        let (short_leg, m_head) = sorted[head];
        let (long_leg, m_tail) = sorted[tail];
        pairs.push((PairKey::new(short_leg, long_leg), (m_head - m_tail).abs()));
        head += 1;
        tail -= 1;
    }
    pairs
}
