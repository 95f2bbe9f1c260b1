//! Road-constrained particle filter
//!
//! [`VehicleTrackingFilter`] is a particle-learning filter: each particle carries a Gaussian
//! belief about the vehicle's path state plus the sufficient statistics of its own on/off-road
//! transition model. Every observation runs the same cycle over the whole population:
//!
//! 1. ask the road network for the candidate paths of each particle and score every edge
//!    of every path with the motion estimator's predictive likelihood,
//! 2. resample the population in proportion to the summed likelihoods,
//! 3. propagate each draw by sampling a path and an edge, applying the Kalman measurement
//!    update on that edge and counting the edge transition.
//!
//! Scoring is independent per particle and may run on the rayon pool. Propagation draws one
//! seed per resampled particle from the filter's generator in a fixed order, so a run is
//! reproducible from [`FilterConfig::seed`].
use crate::graph::{PathSearchParameters, RoadNetwork};
use crate::kalman::{
    CONSTANT_VELOCITY, EdgePrediction, MotionParameters, MotionStateEstimator, estimator_from_tag,
};
use crate::linalg::{log_normalize, log_sum_exp};
use crate::mixture::PathStateMixture;
use crate::particle::{
    LineageArena, ParticleId, ParticlePopulation, ParticleResamplingStrategy, VehicleState,
};
use crate::path::{Path, PathEdge};
use crate::state::{PathState, PathStateDistribution};
use crate::transition::EdgeTransitionEstimator;
use crate::{Observation, Result, TrackingError};

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Filter settings. Every field has a default so partial configuration files work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Population size N
    pub particles: usize,
    pub seed: u64,
    /// Registry tag of the motion estimator
    pub estimator: String,
    pub motion: MotionParameters,
    /// Initial road belief variances `[s, v]`, m² and m²/s²
    pub initial_road_variance: [f64; 2],
    /// Initial free belief variances per axis `[position, velocity]`
    pub initial_free_variance: [f64; 2],
    /// Dirichlet hyper-parameters `[stay, leave]` while on a road
    pub edge_motion_prior: [f64; 2],
    /// Dirichlet hyper-parameters `[stay, join]` while off road
    pub free_motion_prior: [f64; 2],
    /// Slack allowed when placing an initial particle on a nearby edge, m
    pub edge_tolerance: f64,
    pub search: PathSearchParameters,
    pub resampling: ParticleResamplingStrategy,
    /// Generations of ancestry kept in the lineage arena
    pub lineage_depth: usize,
    /// Record [`FilterInformation`] for every step
    pub debug: bool,
    /// Score particles on the rayon thread pool
    pub parallel: bool,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            particles: 100,
            seed: 42,
            estimator: CONSTANT_VELOCITY.to_string(),
            motion: MotionParameters::default(),
            initial_road_variance: [25.0, 4.0],
            initial_free_variance: [25.0, 4.0],
            edge_motion_prior: [1.0, 1.0],
            free_motion_prior: [1.0, 1.0],
            edge_tolerance: 5.0,
            search: PathSearchParameters::default(),
            resampling: ParticleResamplingStrategy::default(),
            lineage_depth: 8,
            debug: false,
            parallel: false,
        }
    }
}
impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.particles == 0 {
            return Err(TrackingError::InvalidConfig(
                "particle count must be positive".to_string(),
            ));
        }
        let positive = |values: &[f64]| values.iter().all(|v| v.is_finite() && *v > 0.0);
        if !positive(&self.initial_road_variance) || !positive(&self.initial_free_variance) {
            return Err(TrackingError::InvalidConfig(
                "initial variances must be positive".to_string(),
            ));
        }
        if !positive(&self.edge_motion_prior) || !positive(&self.free_motion_prior) {
            return Err(TrackingError::InvalidConfig(
                "Dirichlet hyper-parameters must be positive".to_string(),
            ));
        }
        if self.edge_tolerance.is_nan() || self.edge_tolerance < 0.0 {
            return Err(TrackingError::InvalidConfig(
                "edge tolerance must be non-negative".to_string(),
            ));
        }
        if !positive(&[self.search.nearby_radius, self.search.max_distance]) {
            return Err(TrackingError::InvalidConfig(
                "search radius and distance must be positive".to_string(),
            ));
        }
        self.motion.validate()
    }
    fn initial_road_covariance(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&self.initial_road_variance))
    }
    fn initial_free_covariance(&self) -> DMatrix<f64> {
        let [p, v] = self.initial_free_variance;
        DMatrix::from_diagonal(&DVector::from_vec(vec![p, v, p, v]))
    }
}

/// Per-step diagnostics recorded in debug mode.
#[derive(Clone, Debug, Default)]
pub struct FilterInformation {
    pub time: Option<DateTime<Utc>>,
    /// Every candidate path that was scored
    pub evaluated_paths: BTreeSet<Path>,
    /// Normalized resampling probability of each particle before propagation
    pub resample_distribution: Vec<(ParticleId, f64)>,
    /// Candidate paths and their log-likelihoods per particle
    pub particle_paths: BTreeMap<ParticleId, Vec<(Path, f64)>>,
}

/// One scored edge of a candidate path.
#[derive(Clone, Debug)]
struct EdgeScore {
    edge: PathEdge,
    prediction: EdgePrediction,
    log_weight: f64,
}

#[derive(Clone, Debug)]
struct PathScore {
    path: Path,
    edges: Vec<EdgeScore>,
    log_likelihood: f64,
}

#[derive(Clone, Debug)]
struct ParticleScore {
    paths: Vec<PathScore>,
    log_likelihood: f64,
}

/// Summary of one filter step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepSummary {
    pub distinct_particles: usize,
    pub evaluated_paths: usize,
    pub effective_sample_size: f64,
    pub on_road_fraction: f64,
}

/// Draw an index from a categorical given by log-weights.
fn sample_index<R: Rng + ?Sized>(
    log_weights: &[f64],
    rng: &mut R,
    support: &'static str,
) -> Result<usize> {
    let weights = log_normalize(log_weights).ok_or(TrackingError::EmptyCandidateSet(support))?;
    let u: f64 = rng.random();
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if u < acc {
            return Ok(i);
        }
    }
    weights
        .iter()
        .rposition(|w| *w > 0.0)
        .ok_or(TrackingError::EmptyCandidateSet(support))
}

/// Particle filter tracking a vehicle over a road network `G`.
pub struct VehicleTrackingFilter<G: RoadNetwork> {
    config: FilterConfig,
    graph: Arc<G>,
    estimator: Arc<dyn MotionStateEstimator>,
    population: ParticlePopulation,
    lineage: LineageArena,
    rng: StdRng,
    last_observation: Option<Observation>,
    information: Vec<FilterInformation>,
}
impl<G: RoadNetwork> Debug for VehicleTrackingFilter<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleTrackingFilter")
            .field("estimator", &self.estimator.tag())
            .field("particles", &self.config.particles)
            .field("distinct", &self.population.len())
            .field("lineage", &self.lineage.len())
            .field(
                "last_observation",
                &format_args!(
                    "{}",
                    self.last_observation
                        .as_ref()
                        .map_or("none".to_string(), |o| o.time.to_rfc3339())
                ),
            )
            .finish()
    }
}
impl<G: RoadNetwork> VehicleTrackingFilter<G> {
    /// Validate `config` and resolve its motion estimator.
    pub fn new(config: FilterConfig, graph: Arc<G>) -> Result<Self> {
        config.validate()?;
        let estimator = estimator_from_tag(&config.estimator, config.motion.clone())?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(VehicleTrackingFilter {
            config,
            graph,
            estimator,
            population: ParticlePopulation::new(),
            lineage: LineageArena::new(),
            rng,
            last_observation: None,
            information: Vec::new(),
        })
    }
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn graph(&self) -> &Arc<G> {
        &self.graph
    }
    pub fn estimator(&self) -> &Arc<dyn MotionStateEstimator> {
        &self.estimator
    }
    pub fn population(&self) -> &ParticlePopulation {
        &self.population
    }
    pub fn lineage(&self) -> &LineageArena {
        &self.lineage
    }
    pub fn last_observation(&self) -> Option<&Observation> {
        self.last_observation.as_ref()
    }
    /// Diagnostics of every step so far, empty unless [`FilterConfig::debug`] is set.
    pub fn information(&self) -> &[FilterInformation] {
        &self.information
    }
    pub fn is_initialized(&self) -> bool {
        !self.population.is_empty()
    }
    /// Forget the population. The next observation reinitializes the filter; the random
    /// generator keeps its position.
    pub fn reset(&mut self) {
        self.population = ParticlePopulation::new();
        self.lineage = LineageArena::new();
        self.last_observation = None;
    }

    /// Point estimate: the mean of the population viewed as a mixture.
    pub fn estimate(&self) -> Option<PathState> {
        self.mixture().mean()
    }
    pub fn mixture(&self) -> PathStateMixture {
        self.population.to_mixture()
    }

    /// Build an initial population around `observation`.
    ///
    /// Each particle is sampled from one candidate per nearby edge plus a free-motion
    /// candidate, weighted by the observation likelihood.
    pub fn create_initial_particles(
        &mut self,
        observation: &Observation,
    ) -> Result<ParticlePopulation> {
        let mut population = ParticlePopulation::new();
        for _ in 0..self.config.particles {
            let mut rng = StdRng::seed_from_u64(self.rng.random());
            let mut candidates = self.initial_candidates(observation, &mut rng);
            let weights: Vec<f64> = candidates.iter().map(|(_, _, w)| *w).collect();
            let chosen = sample_index(&weights, &mut rng, "initial candidates")?;
            let (belief, transition, _) = candidates.swap_remove(chosen);
            let state = VehicleState::new(
                self.lineage.allocate(),
                None,
                0,
                belief,
                transition,
                observation.clone(),
                self.estimator.clone(),
            );
            let id = state.id();
            if !population.insert(state.clone(), 1) {
                self.lineage.record(&state);
            }
            trace!("initial particle {} on {}", id, state.edge());
        }
        Ok(population)
    }

    /// Weighted starting hypotheses for one particle: the observation on every nearby edge,
    /// then free motion at the observed point.
    fn initial_candidates(
        &self,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> Vec<(PathStateDistribution, EdgeTransitionEstimator, f64)> {
        let point = observation.projected;
        let base_transition =
            EdgeTransitionEstimator::new(self.config.edge_motion_prior, self.config.free_motion_prior);
        let edges = self
            .graph
            .nearby_edges(&point, self.config.search.nearby_radius);
        let mut candidates = Vec::with_capacity(edges.len() + 1);
        for edge in &edges {
            let path = Path::from_road_edges(std::slice::from_ref(edge), false);
            let offset = self.graph.length_along_edge(edge, &point);
            let at_rest = PathState::new(path.clone(), DVector::from_vec(vec![offset, 0.0]));
            let speed = self.estimator.sample_transition(&at_rest, 1.0, rng).state()[1];
            let Some(state) = path.first_edge().checked_state_on_edge(
                &DVector::from_vec(vec![offset, speed]),
                self.config.edge_tolerance,
                false,
            ) else {
                continue;
            };
            let belief = PathStateDistribution::new(
                PathState::new(path, state),
                self.config.initial_road_covariance(),
            );
            let log_weight = self.estimator.observation_log_likelihood(&belief, &point);
            candidates.push((belief, base_transition.clone(), log_weight));
        }
        let at_rest = PathState::new(
            Path::null(),
            DVector::from_vec(vec![point.x, 0.0, point.y, 0.0]),
        );
        let sampled = self.estimator.sample_transition(&at_rest, 1.0, rng);
        let free_state = DVector::from_vec(vec![
            point.x,
            sampled.state()[1],
            point.y,
            sampled.state()[3],
        ]);
        let free_belief = PathStateDistribution::new(
            PathState::new(Path::null(), free_state),
            self.config.initial_free_covariance(),
        );
        let log_weight = self.estimator.observation_log_likelihood(&free_belief, &point);
        candidates.push((
            free_belief,
            base_transition.sample_prior_parameters(rng),
            log_weight,
        ));
        candidates
    }

    /// Process one observation. The first observation (or the first after [`reset`])
    /// initializes the population.
    ///
    /// [`reset`]: VehicleTrackingFilter::reset
    pub fn update(&mut self, observation: &Observation) -> Result<StepSummary> {
        let Some(previous) = self.last_observation.clone().filter(|_| self.is_initialized())
        else {
            self.population = self.create_initial_particles(observation)?;
            self.last_observation = Some(observation.clone());
            let summary = self.summary(0);
            debug!(
                "initialized {} particles ({} distinct, {:.0}% on road) at {}",
                self.population.total(),
                summary.distinct_particles,
                100.0 * summary.on_road_fraction,
                observation.time.to_rfc3339()
            );
            return Ok(summary);
        };
        let dt = observation.seconds_since(&previous);
        if dt < 0.0 {
            return Err(TrackingError::OutOfOrderObservation {
                previous: previous.time,
                current: observation.time,
            });
        }

        let entries: Vec<(&VehicleState, usize)> = self.population.iter().collect();
        let scores: Vec<ParticleScore> = if self.config.parallel {
            entries
                .par_iter()
                .map(|(state, _)| self.score_particle(state, observation, dt))
                .collect()
        } else {
            entries
                .iter()
                .map(|(state, _)| self.score_particle(state, observation, dt))
                .collect()
        };
        let evaluated_paths: usize = scores.iter().map(|s| s.paths.len()).sum();

        let log_weights: Vec<f64> = entries
            .iter()
            .zip(&scores)
            .map(|((_, count), score)| score.log_likelihood + (*count as f64).ln())
            .collect();
        let draws = match self
            .config
            .resampling
            .resample(&log_weights, self.config.particles, &mut self.rng)
        {
            Ok(draws) => draws,
            Err(err) => {
                warn!(
                    "no particle explains the observation at {}: {}",
                    observation.time.to_rfc3339(),
                    err
                );
                return Err(err);
            }
        };

        if self.config.debug {
            self.information
                .push(Self::information_for(observation, &entries, &scores, &log_weights));
        }

        let mut population = ParticlePopulation::new();
        for index in draws {
            let mut rng = StdRng::seed_from_u64(self.rng.random());
            let id = self.lineage.allocate();
            let parent = entries[index].0;
            let state = self.propagate(id, parent, &scores[index], observation, &mut rng)?;
            if !population.insert(state.clone(), 1) {
                self.lineage.record(&state);
            }
        }
        drop(entries);
        self.population = population;
        self.last_observation = Some(observation.clone());
        let pruned = self
            .lineage
            .prune(self.population.ids(), self.config.lineage_depth);

        let summary = self.summary(evaluated_paths);
        debug!(
            "{}: {} particles ({} distinct), {} paths, ess {:.1}, {:.0}% on road, {} lineage records pruned",
            observation.time.to_rfc3339(),
            self.population.total(),
            summary.distinct_particles,
            evaluated_paths,
            summary.effective_sample_size,
            100.0 * summary.on_road_fraction,
            pruned
        );
        Ok(summary)
    }

    fn summary(&self, evaluated_paths: usize) -> StepSummary {
        StepSummary {
            distinct_particles: self.population.len(),
            evaluated_paths,
            effective_sample_size: self.population.effective_sample_size(),
            on_road_fraction: self.population.on_road_fraction(),
        }
    }

    /// Predictive scores of every candidate path of `state`.
    ///
    /// Edge predictions are cached by path edge, so an edge shared by several candidate
    /// paths is only scored once.
    fn score_particle(&self, state: &VehicleState, observation: &Observation, dt: f64) -> ParticleScore {
        let belief = state.belief();
        let previous_edge = state.edge();
        let mut cache: HashMap<PathEdge, Option<EdgePrediction>> = HashMap::new();
        let mut paths = Vec::new();
        for path in self
            .graph
            .paths(belief, observation, &self.config.search)
        {
            let predicted = self.estimator.predict(belief, &path, dt);
            let mut edges = Vec::with_capacity(path.edges().len());
            for edge in path.edges() {
                let prediction = cache
                    .entry(edge.clone())
                    .or_insert_with(|| {
                        self.estimator
                            .edge_predictive(&predicted, edge, &observation.projected)
                    })
                    .clone();
                let Some(mut prediction) = prediction else {
                    continue;
                };
                if prediction.belief.path() != &path {
                    // same edge reached through another candidate path
                    prediction.belief = PathStateDistribution::new(
                        PathState::new(path.clone(), prediction.belief.mean().state().clone()),
                        prediction.belief.covariance().clone(),
                    );
                }
                let log_weight = prediction.log_likelihood
                    + state
                        .transition()
                        .log_evaluate(Some(previous_edge.edge()), edge.edge());
                if log_weight.is_nan() || log_weight == f64::NEG_INFINITY {
                    continue;
                }
                edges.push(EdgeScore {
                    edge: edge.clone(),
                    prediction,
                    log_weight,
                });
            }
            if edges.is_empty() {
                continue;
            }
            let weights: Vec<f64> = edges.iter().map(|e| e.log_weight).collect();
            let log_likelihood = log_sum_exp(&weights);
            trace!(
                "particle {}: path {} scored {:.3}",
                state.id(),
                path,
                log_likelihood
            );
            paths.push(PathScore {
                path,
                edges,
                log_likelihood,
            });
        }
        let totals: Vec<f64> = paths.iter().map(|p| p.log_likelihood).collect();
        let log_likelihood = if totals.is_empty() {
            f64::NEG_INFINITY
        } else {
            log_sum_exp(&totals)
        };
        ParticleScore {
            paths,
            log_likelihood,
        }
    }

    /// Move a resampled particle to the new observation.
    fn propagate(
        &self,
        id: ParticleId,
        parent: &VehicleState,
        score: &ParticleScore,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> Result<VehicleState> {
        let path_weights: Vec<f64> = score.paths.iter().map(|p| p.log_likelihood).collect();
        let path_score = &score.paths[sample_index(&path_weights, rng, "candidate paths")?];
        let edge_score = if path_score.edges.len() > 1 {
            let edge_weights: Vec<f64> = path_score.edges.iter().map(|e| e.log_weight).collect();
            &path_score.edges[sample_index(&edge_weights, rng, "path edges")?]
        } else {
            &path_score.edges[0]
        };
        // the measurement keeps the posterior on the sampled edge; its ground state is
        // derived once in `VehicleState::new`
        let posterior = self.estimator.measure(
            &edge_score.prediction.belief,
            &observation.projected,
            &edge_score.edge,
        );
        let transition = if score.paths.len() > 1 {
            parent
                .transition()
                .update(parent.edge().edge(), edge_score.edge.edge())
        } else {
            parent.transition().clone()
        };
        Ok(VehicleState::new(
            id,
            Some(parent.id()),
            parent.generation() + 1,
            posterior,
            transition,
            observation.clone(),
            parent.motion().clone(),
        ))
    }

    fn information_for(
        observation: &Observation,
        entries: &[(&VehicleState, usize)],
        scores: &[ParticleScore],
        log_weights: &[f64],
    ) -> FilterInformation {
        let probabilities = log_normalize(log_weights).unwrap_or_default();
        let mut information = FilterInformation {
            time: Some(observation.time),
            ..FilterInformation::default()
        };
        for (((state, _), score), p) in entries.iter().zip(scores).zip(probabilities) {
            information.resample_distribution.push((state.id(), p));
            let paths: Vec<(Path, f64)> = score
                .paths
                .iter()
                .map(|s| (s.path.clone(), s.log_likelihood))
                .collect();
            information
                .evaluated_paths
                .extend(paths.iter().map(|(path, _)| path.clone()));
            information.particle_paths.insert(state.id(), paths);
        }
        information
    }
}
