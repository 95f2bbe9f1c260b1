//! Log-weighted mixtures of path-state beliefs.
//!
//! The filter summarises its population as one of these (one component per distinct
//! particle, weighted by its multiplicity) and reports [`PathStateMixture::mean`] as the
//! point estimate.
use crate::linalg::{log_add, log_sum_exp};
use crate::path::{Path, PathEdge};
use crate::state::{PathState, PathStateDistribution};

use nalgebra::DVector;
use std::collections::BTreeMap;

/// A finite mixture of [`PathStateDistribution`]s with natural-log prior weights.
#[derive(Clone, Debug, Default)]
pub struct PathStateMixture {
    components: Vec<PathStateDistribution>,
    log_weights: Vec<f64>,
}

/// Per-edge accumulation for [`PathStateMixture::mean`].
struct EdgeSummary {
    weight: f64,
    weighted_sum: DVector<f64>,
    paths: Vec<(Path, f64)>,
}

impl PathStateMixture {
    pub fn new(components: Vec<PathStateDistribution>, log_weights: Vec<f64>) -> Self {
        assert_eq!(
            components.len(),
            log_weights.len(),
            "one log-weight per component"
        );
        assert!(
            log_weights.iter().all(|w| !w.is_nan()),
            "log-weights must not be NaN"
        );
        PathStateMixture {
            components,
            log_weights,
        }
    }
    pub fn push(&mut self, component: PathStateDistribution, log_weight: f64) {
        assert!(!log_weight.is_nan(), "log-weights must not be NaN");
        self.components.push(component);
        self.log_weights.push(log_weight);
    }
    pub fn len(&self) -> usize {
        self.components.len()
    }
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
    pub fn components(&self) -> &[PathStateDistribution] {
        &self.components
    }
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// `ln Σ exp(w_k)` by pairwise log-addition. `-inf` for an empty mixture.
    pub fn log_prior_weight_sum(&self) -> f64 {
        match self.log_weights.split_first() {
            None => f64::NEG_INFINITY,
            Some((first, rest)) => rest.iter().fold(*first, |acc, &w| log_add(acc, w)),
        }
    }

    /// Linear prior weights summing to one; uniform if every log-weight is `-inf`.
    pub fn normalized_weights(&self) -> Vec<f64> {
        let log_z = self.log_prior_weight_sum();
        let k = self.log_weights.len();
        if !log_z.is_finite() {
            return vec![1.0 / k as f64; k];
        }
        self.log_weights.iter().map(|w| (w - log_z).exp()).collect()
    }

    pub fn component_likelihoods(&self, value: &PathState) -> Vec<f64> {
        self.components.iter().map(|c| c.evaluate(value)).collect()
    }

    pub fn density(&self, value: &PathState) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let log_terms: Vec<f64> = self
            .components
            .iter()
            .zip(&self.log_weights)
            .map(|(c, w)| c.log_evaluate(value) + w)
            .collect();
        (log_sum_exp(&log_terms) - self.log_prior_weight_sum()).exp()
    }

    pub fn log_density(&self, value: &PathState) -> f64 {
        self.density(value).ln()
    }

    /// Posterior responsibility of each component for `value`.
    ///
    /// When every component likelihood is zero the likelihoods are replaced by a uniform
    /// categorical before weighting, and likewise if the weighted sum vanishes.
    pub fn component_probabilities(&self, value: &PathState) -> Vec<f64> {
        let k = self.components.len();
        if k == 0 {
            return Vec::new();
        }
        let mut likelihoods = self.component_likelihoods(value);
        if likelihoods.iter().sum::<f64>() <= 0.0 {
            likelihoods.fill(1.0 / k as f64);
        }
        for (l, w) in likelihoods.iter_mut().zip(self.normalized_weights()) {
            *l *= w;
        }
        let mut total: f64 = likelihoods.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            likelihoods.fill(1.0 / k as f64);
            total = 1.0;
        }
        likelihoods.iter().map(|l| l / total).collect()
    }

    /// Index of the component most responsible for `value`, first one on ties.
    pub fn most_likely_component_index(&self, value: &PathState) -> Option<usize> {
        let probabilities = self.component_probabilities(value);
        let mut best: Option<(usize, f64)> = None;
        for (i, p) in probabilities.into_iter().enumerate() {
            if best.is_none_or(|(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Weighted mean restricted to the dominant edge.
    ///
    /// Components are grouped by the edge their mean sits on. The edge with the largest
    /// total prior weight wins, and the result is the weighted average of that edge's
    /// component means placed on the heaviest path among them. This is not the single
    /// heaviest component.
    pub fn mean(&self) -> Option<PathState> {
        if self.is_empty() {
            return None;
        }
        let weights = self.normalized_weights();
        let mut edges: BTreeMap<PathEdge, EdgeSummary> = BTreeMap::new();
        for (component, w) in self.components.iter().zip(weights) {
            let mean = component.mean();
            let summary = edges.entry(mean.edge()).or_insert_with(|| EdgeSummary {
                weight: 0.0,
                weighted_sum: DVector::zeros(mean.state().len()),
                paths: Vec::new(),
            });
            summary.weight += w;
            summary.weighted_sum += mean.state() * w;
            match summary.paths.iter_mut().find(|(p, _)| p == mean.path()) {
                Some((_, total)) => *total += w,
                None => summary.paths.push((mean.path().clone(), w)),
            }
        }
        let mut best: Option<&EdgeSummary> = None;
        for summary in edges.values() {
            if best.is_none_or(|b| summary.weight > b.weight) {
                best = Some(summary);
            }
        }
        let summary = best?;
        let mut best_path: Option<&(Path, f64)> = None;
        for entry in &summary.paths {
            if best_path.is_none_or(|b| entry.1 > b.1) {
                best_path = Some(entry);
            }
        }
        let (path, _) = best_path?;
        let state = if summary.weight > 0.0 {
            &summary.weighted_sum / summary.weight
        } else {
            summary.weighted_sum.clone()
        };
        Some(PathState::new(path.clone(), state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::tests::straight_edge;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;

    fn road_belief(path: &Path, s: f64, v: f64) -> PathStateDistribution {
        PathStateDistribution::new(
            PathState::new(path.clone(), DVector::from_vec(vec![s, v])),
            DMatrix::identity(2, 2),
        )
    }

    #[test]
    fn test_log_prior_weight_sum_sizes() {
        let path = Path::from_road_edges(&[straight_edge(1, (0.0, 0.0), (100.0, 0.0))], false);
        let mut mixture = PathStateMixture::default();
        assert_eq!(mixture.log_prior_weight_sum(), f64::NEG_INFINITY);
        mixture.push(road_belief(&path, 1.0, 0.0), -2.5);
        assert_eq!(mixture.log_prior_weight_sum(), -2.5);
        mixture.push(road_belief(&path, 2.0, 0.0), 0.3);
        mixture.push(road_belief(&path, 3.0, 0.0), -40.0);
        let direct = ((-2.5_f64).exp() + 0.3_f64.exp() + (-40.0_f64).exp()).ln();
        assert_approx_eq!(mixture.log_prior_weight_sum(), direct, 1e-12);
    }

    #[test]
    fn test_mean_on_shared_edge() {
        let path = Path::from_road_edges(&[straight_edge(1, (0.0, 0.0), (100.0, 0.0))], false);
        let mixture = PathStateMixture::new(
            vec![road_belief(&path, 10.0, 2.0), road_belief(&path, 20.0, 4.0)],
            vec![0.9_f64.ln(), 0.1_f64.ln()],
        );
        let mean = mixture.mean().unwrap();
        assert_eq!(mean.path(), &path);
        assert_approx_eq!(mean.state()[0], 0.9 * 10.0 + 0.1 * 20.0, 1e-12);
        assert_approx_eq!(mean.state()[1], 0.9 * 2.0 + 0.1 * 4.0, 1e-12);
    }

    #[test]
    fn test_mean_prefers_heaviest_edge_over_heaviest_component() {
        let a = straight_edge(1, (0.0, 0.0), (100.0, 0.0));
        let b = straight_edge(2, (100.0, 0.0), (200.0, 0.0));
        let on_a = Path::from_road_edges(&[a.clone()], false);
        let a_then_b = Path::from_road_edges(&[a, b], false);
        let mixture = PathStateMixture::new(
            vec![
                road_belief(&on_a, 10.0, 0.0),
                road_belief(&a_then_b, 30.0, 0.0),
                road_belief(&a_then_b, 150.0, 0.0),
            ],
            vec![0.25_f64.ln(), 0.3_f64.ln(), 0.45_f64.ln()],
        );
        let mean = mixture.mean().unwrap();
        // edge 1 carries 0.55 in total against 0.45 for edge 2
        assert_eq!(mean.edge().edge().id(), Some(1));
        assert_eq!(mean.path(), &a_then_b);
        assert_approx_eq!(mean.state()[0], (0.25 * 10.0 + 0.3 * 30.0) / 0.55, 1e-12);
    }

    #[test]
    fn test_component_probabilities_and_fallback() {
        let path = Path::from_road_edges(&[straight_edge(1, (0.0, 0.0), (100.0, 0.0))], false);
        let mixture = PathStateMixture::new(
            vec![road_belief(&path, 10.0, 0.0), road_belief(&path, 50.0, 0.0)],
            vec![0.5_f64.ln(), 0.5_f64.ln()],
        );
        let near_second = PathState::new(path.clone(), DVector::from_vec(vec![49.0, 0.0]));
        assert_eq!(mixture.most_likely_component_index(&near_second), Some(1));
        let probabilities = mixture.component_probabilities(&near_second);
        assert_approx_eq!(probabilities.iter().sum::<f64>(), 1.0, 1e-12);

        // far from both: likelihoods underflow to zero, fall back on the prior weights
        let far = PathState::new(path.clone(), DVector::from_vec(vec![1e6, 0.0]));
        let probabilities = mixture.component_probabilities(&far);
        assert_approx_eq!(probabilities[0], 0.5, 1e-12);
        assert_eq!(mixture.most_likely_component_index(&far), Some(0));

        let density = mixture.density(&near_second);
        let expected = 0.5 * mixture.components()[0].evaluate(&near_second)
            + 0.5 * mixture.components()[1].evaluate(&near_second);
        assert_approx_eq!(density, expected, 1e-15);
        assert!(PathStateMixture::default().mean().is_none());
        assert_eq!(PathStateMixture::default().most_likely_component_index(&far), None);
    }
}
