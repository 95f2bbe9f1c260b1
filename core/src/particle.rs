//! Particles, the counted particle population, lineage bookkeeping and resampling.
//!
//! A particle is an immutable [`VehicleState`]. The population keeps one entry per
//! structurally distinct state together with its multiplicity, so a resample that draws
//! the same hypothesis many times stores it once. Each state remembers the id of the
//! particle it was propagated from; the ids resolve through a [`LineageArena`], which can be
//! pruned once old generations are no longer needed.
use crate::kalman::MotionStateEstimator;
use crate::linalg::log_normalize;
use crate::mixture::PathStateMixture;
use crate::path::{EdgeId, Path, PathEdge};
use crate::state::PathStateDistribution;
use crate::transition::EdgeTransitionEstimator;
use crate::{Observation, Point2, Result, TrackingError};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use nalgebra::DVector;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifier of a particle in the [`LineageArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(pub u64);
impl Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One hypothesis of the filter.
#[derive(Clone)]
pub struct VehicleState {
    id: ParticleId,
    parent: Option<ParticleId>,
    generation: u64,
    belief: PathStateDistribution,
    transition: EdgeTransitionEstimator,
    observation: Observation,
    motion: Arc<dyn MotionStateEstimator>,
    ground_state: DVector<f64>,
}
impl VehicleState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ParticleId,
        parent: Option<ParticleId>,
        generation: u64,
        belief: PathStateDistribution,
        transition: EdgeTransitionEstimator,
        observation: Observation,
        motion: Arc<dyn MotionStateEstimator>,
    ) -> Self {
        let ground_state = belief.mean().ground_state();
        VehicleState {
            id,
            parent,
            generation,
            belief,
            transition,
            observation,
            motion,
            ground_state,
        }
    }
    pub fn id(&self) -> ParticleId {
        self.id
    }
    pub fn parent(&self) -> Option<ParticleId> {
        self.parent
    }
    pub fn generation(&self) -> u64 {
        self.generation
    }
    pub fn belief(&self) -> &PathStateDistribution {
        &self.belief
    }
    pub fn transition(&self) -> &EdgeTransitionEstimator {
        &self.transition
    }
    pub fn observation(&self) -> &Observation {
        &self.observation
    }
    pub fn motion(&self) -> &Arc<dyn MotionStateEstimator> {
        &self.motion
    }
    pub fn path(&self) -> &Path {
        self.belief.path()
    }
    pub fn edge(&self) -> PathEdge {
        self.belief.edge()
    }
    pub fn is_on_road(&self) -> bool {
        self.belief.is_on_road()
    }
    /// Posterior mean in ground coordinates `[x, vx, y, vy]`.
    pub fn ground_state(&self) -> &DVector<f64> {
        &self.ground_state
    }
    pub fn ground_position(&self) -> Point2 {
        Point2::new(self.ground_state[0], self.ground_state[2])
    }
    pub fn speed(&self) -> f64 {
        self.ground_state[1].hypot(self.ground_state[3])
    }
    fn structural_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
/// Structural: identity and lineage are ignored.
impl PartialEq for VehicleState {
    fn eq(&self, other: &Self) -> bool {
        self.observation.time == other.observation.time
            && self.transition == other.transition
            && self.belief == other.belief
    }
}
impl Eq for VehicleState {}
impl Hash for VehicleState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.observation.time.hash(state);
        self.transition.hash(state);
        self.belief.hash(state);
    }
}
impl Debug for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleState")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("generation", &self.generation)
            .field("path", &format_args!("{}", self.path()))
            .field("state", &self.belief.mean().state().as_slice())
            .field(
                "ground",
                &format_args!(
                    "({:.2}, {:.2}) m, ({:.2}, {:.2}) m/s",
                    self.ground_state[0],
                    self.ground_state[2],
                    self.ground_state[1],
                    self.ground_state[3]
                ),
            )
            .field("transition", &format_args!("{}", self.transition))
            .field("motion", &self.motion.tag())
            .finish()
    }
}
impl Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VehicleState {} [{}, ({:.2}, {:.2})]",
            self.id,
            self.edge(),
            self.ground_state[0],
            self.ground_state[2]
        )
    }
}

/// What the lineage arena remembers about a particle.
#[derive(Clone, Debug, PartialEq)]
pub struct LineageRecord {
    pub id: ParticleId,
    pub parent: Option<ParticleId>,
    pub generation: u64,
    pub time: DateTime<Utc>,
    pub position: Point2,
    pub edge: Option<EdgeId>,
}

/// Append-only history of particles keyed by id, holding parent links only.
#[derive(Clone, Debug, Default)]
pub struct LineageArena {
    records: HashMap<ParticleId, LineageRecord>,
    next_id: u64,
}
impl LineageArena {
    pub fn new() -> Self {
        LineageArena::default()
    }
    /// Reserve a fresh id.
    pub fn allocate(&mut self) -> ParticleId {
        let id = ParticleId(self.next_id);
        self.next_id += 1;
        id
    }
    pub fn record(&mut self, state: &VehicleState) {
        self.records.insert(
            state.id(),
            LineageRecord {
                id: state.id(),
                parent: state.parent(),
                generation: state.generation(),
                time: state.observation().time,
                position: state.ground_position(),
                edge: state.edge().edge().id(),
            },
        );
    }
    pub fn get(&self, id: ParticleId) -> Option<&LineageRecord> {
        self.records.get(&id)
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    /// `id` followed by its recorded ancestors, newest first. Stops at the first missing
    /// record.
    pub fn ancestry(&self, id: ParticleId) -> Vec<&LineageRecord> {
        let mut chain = Vec::new();
        let mut current = self.records.get(&id);
        while let Some(record) = current {
            chain.push(record);
            current = record.parent.and_then(|p| self.records.get(&p));
        }
        chain
    }
    /// Drop every record that is not within `depth` generations of a live particle.
    ///
    /// Returns the number of records removed.
    pub fn prune<I: IntoIterator<Item = ParticleId>>(&mut self, live: I, depth: usize) -> usize {
        let mut keep: HashSet<ParticleId> = HashSet::new();
        for id in live {
            let mut current = Some(id);
            let mut steps = 0;
            while let Some(cid) = current {
                if steps > depth || !keep.insert(cid) {
                    break;
                }
                current = self.records.get(&cid).and_then(|r| r.parent);
                steps += 1;
            }
        }
        let before = self.records.len();
        self.records.retain(|id, _| keep.contains(id));
        before - self.records.len()
    }
}

/// The filter's particles, as distinct states with multiplicities.
#[derive(Clone, Debug, Default)]
pub struct ParticlePopulation {
    entries: Vec<(VehicleState, usize)>,
    index: HashMap<u64, Vec<usize>>,
}
impl ParticlePopulation {
    pub fn new() -> Self {
        ParticlePopulation::default()
    }
    /// Add `count` copies of `state`, merging with a structurally equal entry.
    ///
    /// Returns true when the state was merged.
    pub fn insert(&mut self, state: VehicleState, count: usize) -> bool {
        let key = state.structural_hash();
        let slots = self.index.entry(key).or_default();
        if let Some(&i) = slots.iter().find(|&&i| self.entries[i].0 == state) {
            self.entries[i].1 += count;
            return true;
        }
        slots.push(self.entries.len());
        self.entries.push((state, count));
        false
    }
    /// Number of distinct states.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Sum of multiplicities.
    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, c)| c).sum()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&VehicleState, usize)> {
        self.entries.iter().map(|(s, c)| (s, *c))
    }
    pub fn states(&self) -> impl Iterator<Item = &VehicleState> {
        self.entries.iter().map(|(s, _)| s)
    }
    pub fn ids(&self) -> Vec<ParticleId> {
        self.entries.iter().map(|(s, _)| s.id()).collect()
    }
    /// `1 / Σ (c_i / N)²` over the multiplicities.
    pub fn effective_sample_size(&self) -> f64 {
        let n = self.total() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let sum_sq: f64 = self
            .entries
            .iter()
            .map(|(_, c)| (*c as f64 / n).powi(2))
            .sum();
        1.0 / sum_sq
    }
    /// Fraction of particles on a road edge.
    pub fn on_road_fraction(&self) -> f64 {
        let n = self.total();
        if n == 0 {
            return 0.0;
        }
        let on_road: usize = self.iter().filter(|(s, _)| s.is_on_road()).map(|(_, c)| c).sum();
        on_road as f64 / n as f64
    }
    /// The population as a mixture with one component per distinct state.
    pub fn to_mixture(&self) -> PathStateMixture {
        let n = self.total() as f64;
        let mut mixture = PathStateMixture::default();
        for (state, count) in self.iter() {
            mixture.push(state.belief().clone(), (count as f64 / n).ln());
        }
        mixture
    }
}

/// How a new population is drawn from weighted particles. Every strategy draws exactly
/// the requested number of indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ParticleResamplingStrategy {
    #[default]
    Multinomial,
    Systematic,
    Stratified,
    Residual,
}
impl ParticleResamplingStrategy {
    /// Draw `n` indices into `log_weights` with replacement.
    ///
    /// Fails with [`TrackingError::EmptyPopulation`] when there is nothing to draw from and
    /// with [`TrackingError::DegeneratePopulation`] when every weight is `-inf`.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        log_weights: &[f64],
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        if log_weights.is_empty() {
            return Err(TrackingError::EmptyPopulation);
        }
        let weights = log_normalize(log_weights)
            .ok_or(TrackingError::DegeneratePopulation(log_weights.len()))?;
        let indices = match self {
            ParticleResamplingStrategy::Multinomial => {
                let cumulative = cumulative_sum(&weights);
                (0..n)
                    .map(|_| search(&cumulative, rng.random::<f64>()))
                    .collect()
            }
            ParticleResamplingStrategy::Systematic => {
                let u0 = rng.random::<f64>();
                ordered_draws(&weights, (0..n).map(|i| (i as f64 + u0) / n as f64))
            }
            ParticleResamplingStrategy::Stratified => {
                let positions: Vec<f64> = (0..n)
                    .map(|i| (i as f64 + rng.random::<f64>()) / n as f64)
                    .collect();
                ordered_draws(&weights, positions.into_iter())
            }
            ParticleResamplingStrategy::Residual => residual_resample(&weights, n, rng),
        };
        Ok(indices)
    }
}

fn cumulative_sum(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// First index whose cumulative weight exceeds `u`, skipping zero-weight entries.
fn search(cumulative: &[f64], u: f64) -> usize {
    let total = cumulative[cumulative.len() - 1];
    let target = u * total;
    cumulative
        .partition_point(|&c| c <= target)
        .min(cumulative.len() - 1)
}

/// Walk sorted positions in `[0, 1)` through the cumulative weights.
fn ordered_draws(weights: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let cumulative = cumulative_sum(weights);
    let total = cumulative[cumulative.len() - 1];
    let mut i = 0;
    positions
        .map(|u| {
            while i < cumulative.len() - 1 && cumulative[i] <= u * total {
                i += 1;
            }
            i
        })
        .collect()
}

fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let mut indices = Vec::with_capacity(n);
    let mut residual: Vec<f64> = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies.min(n - indices.len())));
        residual[i] = w * n as f64 - copies as f64;
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        if residual.iter().sum::<f64>() <= 0.0 {
            residual = weights.to_vec();
        }
        let cumulative = cumulative_sum(&residual);
        indices.extend((0..remaining).map(|_| search(&cumulative, rng.random::<f64>())));
    }
    indices
}

/// Multiplicity of each index after a resample.
pub fn counts_from_indices(indices: &[usize], len: usize) -> Vec<usize> {
    let mut counts = vec![0; len];
    for &i in indices {
        counts[i] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::{MotionParameters, RoadTrackingEstimator};
    use crate::path::tests::straight_edge;
    use crate::state::PathState;
    use crate::{GeoCoordinate, LocalProjection};
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const STRATEGIES: [ParticleResamplingStrategy; 4] = [
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Residual,
    ];

    fn state(id: u64, parent: Option<u64>, s: f64) -> VehicleState {
        let projection = LocalProjection::new(GeoCoordinate::new(0.0, 0.0));
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let path = Path::from_road_edges(&[straight_edge(1, (0.0, 0.0), (100.0, 0.0))], false);
        let belief = PathStateDistribution::new(
            PathState::new(path, DVector::from_vec(vec![s, 1.0])),
            DMatrix::identity(2, 2),
        );
        VehicleState::new(
            ParticleId(id),
            parent.map(ParticleId),
            parent.map_or(0, |_| 1),
            belief,
            EdgeTransitionEstimator::default(),
            Observation::from_projected(t, Point2::new(s, 0.0), &projection),
            Arc::new(RoadTrackingEstimator::constant_velocity(MotionParameters::default())),
        )
    }

    #[test]
    fn test_resampling_preserves_count() {
        let mut rng = StdRng::seed_from_u64(42);
        let log_weights = [-0.3, -2.0, f64::NEG_INFINITY, -0.7, -5.0];
        for strategy in STRATEGIES {
            for n in [1, 7, 100, 1000] {
                let indices = strategy.resample(&log_weights, n, &mut rng).unwrap();
                assert_eq!(indices.len(), n, "{:?}", strategy);
                let counts = counts_from_indices(&indices, log_weights.len());
                assert_eq!(counts.iter().sum::<usize>(), n);
                assert_eq!(counts[2], 0, "{:?} drew a zero-weight particle", strategy);
            }
        }
    }

    #[test]
    fn test_resampling_ignores_negligible_particle() {
        let mut rng = StdRng::seed_from_u64(7);
        for strategy in STRATEGIES {
            let indices = strategy.resample(&[-1.0, -1.0, -100.0], 1000, &mut rng).unwrap();
            let counts = counts_from_indices(&indices, 3);
            assert!((counts[2] as f64) / 1000.0 < 0.01, "{:?}", strategy);
            assert!(counts[0] > 400 && counts[1] > 400, "{:?} {:?}", strategy, counts);
        }
    }

    #[test]
    fn test_resampling_failures() {
        let mut rng = StdRng::seed_from_u64(1);
        let strategy = ParticleResamplingStrategy::default();
        assert!(matches!(
            strategy.resample(&[], 10, &mut rng),
            Err(TrackingError::EmptyPopulation)
        ));
        assert!(matches!(
            strategy.resample(&[f64::NEG_INFINITY; 3], 10, &mut rng),
            Err(TrackingError::DegeneratePopulation(3))
        ));
    }

    #[test]
    fn test_systematic_is_proportional() {
        let mut rng = StdRng::seed_from_u64(9);
        let weights = [0.5_f64.ln(), 0.25_f64.ln(), 0.25_f64.ln()];
        let indices = ParticleResamplingStrategy::Systematic
            .resample(&weights, 8, &mut rng)
            .unwrap();
        assert_eq!(counts_from_indices(&indices, 3), vec![4, 2, 2]);
        let indices = ParticleResamplingStrategy::Residual
            .resample(&weights, 8, &mut rng)
            .unwrap();
        let counts = counts_from_indices(&indices, 3);
        assert_eq!(counts.iter().sum::<usize>(), 8);
        assert!(counts[0] >= 3 && counts[1] >= 1 && counts[2] >= 1, "{:?}", counts);
    }

    #[test]
    fn test_population_merges_identical_states() {
        let mut population = ParticlePopulation::new();
        assert!(!population.insert(state(0, None, 10.0), 1));
        assert!(population.insert(state(1, None, 10.0), 2));
        assert!(!population.insert(state(2, None, 20.0), 1));
        assert_eq!(population.len(), 2);
        assert_eq!(population.total(), 4);
        let counts: Vec<usize> = population.iter().map(|(_, c)| c).collect();
        assert_eq!(counts, vec![3, 1]);
        assert_eq!(population.ids(), vec![ParticleId(0), ParticleId(2)]);
        assert_approx_eq!(population.effective_sample_size(), 1.0 / (0.75f64.powi(2) + 0.0625), 1e-12);
        assert_eq!(population.on_road_fraction(), 1.0);

        let mixture = population.to_mixture();
        assert_approx_eq!(mixture.log_prior_weight_sum(), 0.0, 1e-12);
        let mean = mixture.mean().unwrap();
        assert_approx_eq!(mean.state()[0], 0.75 * 10.0 + 0.25 * 20.0, 1e-12);
    }

    #[test]
    fn test_lineage_ancestry_and_pruning() {
        let mut arena = LineageArena::new();
        for _ in 0..4 {
            arena.allocate();
        }
        arena.record(&state(0, None, 0.0));
        arena.record(&state(1, Some(0), 1.0));
        arena.record(&state(2, Some(1), 2.0));
        arena.record(&state(3, Some(1), 3.0));
        assert_eq!(arena.allocate(), ParticleId(4));
        let ancestry: Vec<ParticleId> = arena.ancestry(ParticleId(2)).iter().map(|r| r.id).collect();
        assert_eq!(ancestry, vec![ParticleId(2), ParticleId(1), ParticleId(0)]);
        assert_eq!(arena.get(ParticleId(3)).unwrap().edge, Some(1));

        let removed = arena.prune([ParticleId(2)], 1);
        assert_eq!(removed, 2);
        assert!(arena.get(ParticleId(0)).is_none());
        assert!(arena.get(ParticleId(3)).is_none());
        assert_eq!(arena.ancestry(ParticleId(2)).len(), 2);
    }
}
