//! Online estimation of on-road / off-road transition probabilities.
//!
//! Two latent regimes, each with a two-outcome Multinomial over "stay" and "switch":
//!
//! | from \ to | free              | road              |
//! |-----------|-------------------|-------------------|
//! | free      | off→off `[1, 0]`  | off→on `[0, 1]`   |
//! | road      | on→off `[0, 1]`   | on→on `[1, 0]`    |
//!
//! Each Multinomial has a conjugate Dirichlet prior. The Multinomial parameters in use are
//! always the current Dirichlet mean (or, for freshly initialised particles, a draw from the
//! Dirichlet), and [`EdgeTransitionEstimator::update`] returns a new estimator with the
//! observed transition added to the counts. Estimators are plain values: nothing is shared
//! between particles.
use crate::path::InferredEdge;
use crate::state::hash_floats;

use rand::Rng;
use rand_distr::{Beta, Distribution};
use statrs::function::gamma::ln_gamma;
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// Kind of transition between two consecutive edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionType {
    OffToOff,
    OffToOn,
    OnToOn,
    OnToOff,
}
impl TransitionType {
    pub fn between(from: &InferredEdge, to: &InferredEdge) -> TransitionType {
        match (from.is_free(), to.is_free()) {
            (true, true) => TransitionType::OffToOff,
            (true, false) => TransitionType::OffToOn,
            (false, false) => TransitionType::OnToOn,
            (false, true) => TransitionType::OnToOff,
        }
    }
    /// Category counts of a single observed transition.
    pub fn counts(&self) -> [f64; 2] {
        match self {
            TransitionType::OffToOff | TransitionType::OnToOn => [1.0, 0.0],
            TransitionType::OffToOn | TransitionType::OnToOff => [0.0, 1.0],
        }
    }
    pub fn starts_free(&self) -> bool {
        matches!(self, TransitionType::OffToOff | TransitionType::OffToOn)
    }
}

/// `ln` of the Multinomial mass of `counts` under `probabilities`.
pub fn multinomial_log_pmf(counts: &[f64], probabilities: &[f64]) -> f64 {
    let n: f64 = counts.iter().sum();
    let mut log_p = ln_gamma(n + 1.0);
    for (&x, &p) in counts.iter().zip(probabilities) {
        log_p -= ln_gamma(x + 1.0);
        if x > 0.0 {
            log_p += x * p.ln();
        }
    }
    log_p
}

/// `ln` of the compound Dirichlet-Multinomial (multivariate Pólya) mass of `counts`.
pub fn polya_log_pmf(counts: &[f64], alpha: &[f64]) -> f64 {
    let n: f64 = counts.iter().sum();
    let a: f64 = alpha.iter().sum();
    let mut log_p = ln_gamma(n + 1.0) + ln_gamma(a) - ln_gamma(n + a);
    for (&x, &alpha_i) in counts.iter().zip(alpha) {
        log_p += ln_gamma(x + alpha_i) - ln_gamma(alpha_i) - ln_gamma(x + 1.0);
    }
    log_p
}

fn dirichlet_mean(alpha: &[f64; 2]) -> [f64; 2] {
    let total = alpha[0] + alpha[1];
    [alpha[0] / total, alpha[1] / total]
}

/// Draw Multinomial parameters from a two-category Dirichlet, i.e. a Beta.
fn sample_dirichlet<R: Rng + ?Sized>(alpha: &[f64; 2], rng: &mut R) -> [f64; 2] {
    match Beta::new(alpha[0], alpha[1]) {
        Ok(beta) => {
            let p: f64 = beta.sample(rng);
            [p, 1.0 - p]
        }
        Err(_) => dirichlet_mean(alpha),
    }
}

/// Pair of conjugate Dirichlet-Multinomial models for on-road and off-road transitions.
#[derive(Clone, Debug)]
pub struct EdgeTransitionEstimator {
    edge_motion_prior: [f64; 2],
    free_motion_prior: [f64; 2],
    edge_motion_probabilities: [f64; 2],
    free_motion_probabilities: [f64; 2],
}
impl Default for EdgeTransitionEstimator {
    /// Uniform Dirichlet(1, 1) priors.
    fn default() -> Self {
        EdgeTransitionEstimator::new([1.0, 1.0], [1.0, 1.0])
    }
}
impl EdgeTransitionEstimator {
    /// Build from Dirichlet hyper-parameters, using their means as the Multinomial
    /// parameters.
    ///
    /// # Panics
    /// If any hyper-parameter is not finite and strictly positive.
    pub fn new(edge_motion_prior: [f64; 2], free_motion_prior: [f64; 2]) -> Self {
        assert!(
            edge_motion_prior
                .iter()
                .chain(free_motion_prior.iter())
                .all(|a| a.is_finite() && *a > 0.0),
            "Dirichlet parameters must be finite and positive"
        );
        EdgeTransitionEstimator {
            edge_motion_prior,
            free_motion_prior,
            edge_motion_probabilities: dirichlet_mean(&edge_motion_prior),
            free_motion_probabilities: dirichlet_mean(&free_motion_prior),
        }
    }

    /// Same hyper-parameters, with Multinomial parameters drawn from the Dirichlets.
    pub fn sample_prior_parameters<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        EdgeTransitionEstimator {
            edge_motion_probabilities: sample_dirichlet(&self.edge_motion_prior, rng),
            free_motion_probabilities: sample_dirichlet(&self.free_motion_prior, rng),
            ..self.clone()
        }
    }

    pub fn edge_motion_prior(&self) -> &[f64; 2] {
        &self.edge_motion_prior
    }
    pub fn free_motion_prior(&self) -> &[f64; 2] {
        &self.free_motion_prior
    }
    pub fn edge_motion_probabilities(&self) -> &[f64; 2] {
        &self.edge_motion_probabilities
    }
    pub fn free_motion_probabilities(&self) -> &[f64; 2] {
        &self.free_motion_probabilities
    }

    fn probabilities_for(&self, transition: TransitionType) -> &[f64; 2] {
        if transition.starts_free() {
            &self.free_motion_probabilities
        } else {
            &self.edge_motion_probabilities
        }
    }

    pub fn evaluate(&self, from: &InferredEdge, to: &InferredEdge) -> f64 {
        self.log_evaluate(Some(from), to).exp()
    }

    /// Log-probability of moving from `from` to `to` under the current Multinomials.
    ///
    /// With no previous edge (a freshly initialised particle) the `to -> to` transition is
    /// used.
    pub fn log_evaluate(&self, from: Option<&InferredEdge>, to: &InferredEdge) -> f64 {
        let transition = TransitionType::between(from.unwrap_or(to), to);
        multinomial_log_pmf(&transition.counts(), self.probabilities_for(transition))
    }

    /// One conjugate update with the observed transition.
    #[must_use]
    pub fn update(&self, from: &InferredEdge, to: &InferredEdge) -> Self {
        let transition = TransitionType::between(from, to);
        let counts = transition.counts();
        let mut updated = self.clone();
        let (prior, probabilities) = if transition.starts_free() {
            (
                &mut updated.free_motion_prior,
                &mut updated.free_motion_probabilities,
            )
        } else {
            (
                &mut updated.edge_motion_prior,
                &mut updated.edge_motion_probabilities,
            )
        };
        prior[0] += counts[0];
        prior[1] += counts[1];
        *probabilities = dirichlet_mean(prior);
        updated
    }

    /// Posterior-predictive log-probability of the transition, integrating the Multinomial
    /// parameters out against the Dirichlet.
    pub fn predictive_log_likelihood(&self, from: &InferredEdge, to: &InferredEdge) -> f64 {
        let transition = TransitionType::between(from, to);
        let alpha = if transition.starts_free() {
            &self.free_motion_prior
        } else {
            &self.edge_motion_prior
        };
        polya_log_pmf(&transition.counts(), alpha)
    }

    /// Sample the next edge among `candidates` given the current one.
    ///
    /// From free motion, a switch picks uniformly among the road candidates (staying free if
    /// there are none). On a road edge the switch to free motion is only possible when the
    /// free edge is a candidate; otherwise a road candidate is picked uniformly.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        candidates: &[InferredEdge],
        current: &InferredEdge,
    ) -> InferredEdge {
        let roads: Vec<&InferredEdge> = candidates.iter().filter(|e| !e.is_free()).collect();
        let pick_road = |rng: &mut R| -> InferredEdge {
            if roads.is_empty() {
                InferredEdge::Free
            } else {
                roads[rng.random_range(0..roads.len())].clone()
            }
        };
        if current.is_free() {
            if candidates.is_empty() {
                return InferredEdge::Free;
            }
            let switch = rng.random::<f64>() < self.free_motion_probabilities[1];
            if switch {
                pick_road(rng)
            } else {
                InferredEdge::Free
            }
        } else {
            let free_allowed = candidates.iter().any(InferredEdge::is_free);
            let leave_road =
                free_allowed && rng.random::<f64>() < self.edge_motion_probabilities[1];
            if leave_road || candidates.is_empty() {
                InferredEdge::Free
            } else {
                pick_road(rng)
            }
        }
    }

    fn content(&self) -> [f64; 8] {
        [
            self.edge_motion_probabilities[0],
            self.edge_motion_probabilities[1],
            self.free_motion_probabilities[0],
            self.free_motion_probabilities[1],
            self.edge_motion_prior[0],
            self.edge_motion_prior[1],
            self.free_motion_prior[0],
            self.free_motion_prior[1],
        ]
    }
}
impl PartialEq for EdgeTransitionEstimator {
    fn eq(&self, other: &Self) -> bool {
        self.content() == other.content()
    }
}
impl Eq for EdgeTransitionEstimator {}
impl Hash for EdgeTransitionEstimator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_floats(self.content().iter(), state);
    }
}
impl PartialOrd for EdgeTransitionEstimator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EdgeTransitionEstimator {
    fn cmp(&self, other: &Self) -> Ordering {
        self.content()
            .iter()
            .zip(other.content().iter())
            .map(|(a, b)| (a + 0.0).total_cmp(&(b + 0.0)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}
impl Display for EdgeTransitionEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EdgeTransitionEstimator {{ edge: {:?} ~ Dir{:?}, free: {:?} ~ Dir{:?} }}",
            self.edge_motion_probabilities,
            self.edge_motion_prior,
            self.free_motion_probabilities,
            self.free_motion_prior
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::tests::straight_edge;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn road() -> InferredEdge {
        InferredEdge::Road(straight_edge(1, (0.0, 0.0), (10.0, 0.0)))
    }

    #[test]
    fn test_uniform_prior_then_update() {
        let free = InferredEdge::Free;
        let estimator = EdgeTransitionEstimator::default();
        assert_approx_eq!(estimator.evaluate(&free, &free), 0.5, 1e-12);
        assert_approx_eq!(estimator.evaluate(&free, &road()), 0.5, 1e-12);
        let updated = estimator.update(&free, &road());
        assert!(updated.evaluate(&free, &road()) > updated.evaluate(&free, &free));
        assert_approx_eq!(updated.evaluate(&free, &road()), 2.0 / 3.0, 1e-12);
        // the on-road model is untouched
        assert_eq!(updated.edge_motion_prior(), &[1.0, 1.0]);
        // and the original snapshot too
        assert_eq!(estimator.free_motion_prior(), &[1.0, 1.0]);
    }

    #[test]
    fn test_posterior_mean_matches_closed_form() {
        let free = InferredEdge::Free;
        let on = road();
        let mut estimator = EdgeTransitionEstimator::new([2.0, 3.0], [4.0, 1.0]);
        for (from, to) in [(&on, &on), (&on, &free), (&on, &on), (&free, &on)] {
            estimator = estimator.update(from, to);
        }
        // on-road: (2 + 2, 3 + 1) / 8
        assert_approx_eq!(estimator.edge_motion_probabilities()[0], 4.0 / 8.0, 1e-12);
        assert_approx_eq!(estimator.evaluate(&on, &free), 4.0 / 8.0, 1e-12);
        // off-road: (4, 1 + 1) / 6
        assert_approx_eq!(estimator.evaluate(&free, &free), 4.0 / 6.0, 1e-12);
        assert_approx_eq!(estimator.evaluate(&free, &on), 2.0 / 6.0, 1e-12);

        let reordered = [(&free, &on), (&on, &on), (&on, &on), (&on, &free)]
            .into_iter()
            .fold(EdgeTransitionEstimator::new([2.0, 3.0], [4.0, 1.0]), |e, (f, t)| {
                e.update(f, t)
            });
        assert_eq!(reordered, estimator);
    }

    #[test]
    fn test_log_evaluate_without_previous_edge() {
        let estimator = EdgeTransitionEstimator::new([9.0, 1.0], [3.0, 1.0]);
        assert_approx_eq!(estimator.log_evaluate(None, &road()), 0.9_f64.ln(), 1e-12);
        assert_approx_eq!(
            estimator.log_evaluate(None, &InferredEdge::Free),
            0.75_f64.ln(),
            1e-12
        );
    }

    #[test]
    fn test_predictive_uses_hyper_parameters() {
        let estimator = EdgeTransitionEstimator::new([2.0, 6.0], [1.0, 1.0]);
        assert_approx_eq!(
            estimator.predictive_log_likelihood(&road(), &InferredEdge::Free),
            0.75_f64.ln(),
            1e-12
        );
        // a point estimate drawn from the prior differs from the predictive
        let mut rng = StdRng::seed_from_u64(3);
        let sampled = estimator.sample_prior_parameters(&mut rng);
        assert_eq!(sampled.edge_motion_prior(), estimator.edge_motion_prior());
        let p = sampled.edge_motion_probabilities();
        assert_approx_eq!(p[0] + p[1], 1.0, 1e-12);
        assert!(
            (sampled.log_evaluate(Some(&road()), &InferredEdge::Free)
                - sampled.predictive_log_likelihood(&road(), &InferredEdge::Free))
            .abs()
                > 1e-9
        );
    }

    #[test]
    fn test_polya_reference_value() {
        // Dir(1, 1) predictive of two draws landing in the first category: 1/3
        assert_approx_eq!(polya_log_pmf(&[2.0, 0.0], &[1.0, 1.0]), (1.0_f64 / 3.0).ln(), 1e-12);
        assert_approx_eq!(multinomial_log_pmf(&[1.0, 1.0], &[0.5, 0.5]), 0.5_f64.ln(), 1e-12);
    }

    #[test]
    fn test_sample_rules() {
        let mut rng = StdRng::seed_from_u64(11);
        let estimator = EdgeTransitionEstimator::new([1.0, 1.0], [1.0, 9.0]);
        assert!(estimator.sample(&mut rng, &[], &InferredEdge::Free).is_free());
        // free candidates only: switching has nowhere to go
        for _ in 0..20 {
            assert!(
                estimator
                    .sample(&mut rng, &[InferredEdge::Free], &InferredEdge::Free)
                    .is_free()
            );
        }
        // on a road with no free candidate the draw is always another road
        for _ in 0..20 {
            assert!(!estimator.sample(&mut rng, &[road()], &road()).is_free());
        }
        assert!(estimator.sample(&mut rng, &[], &road()).is_free());

        let candidates = [InferredEdge::Free, road()];
        let switches = (0..2000)
            .filter(|_| !estimator.sample(&mut rng, &candidates, &InferredEdge::Free).is_free())
            .count();
        let rate = switches as f64 / 2000.0;
        assert!((rate - 0.9).abs() < 0.03, "switch rate {}", rate);
    }
}
