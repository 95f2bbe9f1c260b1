//! Kalman-style motion and measurement models for road-constrained and free motion.
//!
//! Every particle carries a Gaussian belief over its [`PathState`]. Which linear model applies
//! is decided by the path the belief lives on: the null path uses the four-dimensional ground
//! model, any road path uses the two-dimensional along-road model. Both are driven by white
//! acceleration noise.
//!
//! For one axis with state $[p, v]$ and time step $\Delta t$ the constant velocity model is
//!
//! $$
//! F = \begin{bmatrix} 1 & \Delta t \\\\ 0 & 1 \end{bmatrix}, \quad
//! G = \begin{bmatrix} \Delta t^2 / 2 \\\\ \Delta t \end{bmatrix}, \quad
//! Q = G \sigma_a^2 G^T
//! $$
//!
//! and the ground model stacks two such axes for $[x, v_x, y, v_y]$. Observations are GPS
//! positions in the local plane with covariance $R$. On a road the position is a nonlinear
//! function of $s$, linearised through the unit tangent $u$ of the edge at the mean:
//!
//! $$
//! H = \begin{bmatrix} d\,u_x & 0 \\\\ d\,u_y & 0 \end{bmatrix}
//! $$
//!
//! with $d = \pm 1$ the direction of the path.
//!
//! Estimators are selected by a configuration tag through [`estimator_from_tag`].
use crate::linalg::{gaussian_log_pdf, matrix_square_root, robust_spd_solve, symmetrize};
use crate::path::{Path, PathEdge};
use crate::state::{PathState, PathStateDistribution, position_selector};
use crate::{Point2, Result, TrackingError};

use log::warn;
use nalgebra::{DMatrix, DVector};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// Registry tag of the constant velocity estimator.
pub const CONSTANT_VELOCITY: &str = "constant-velocity";
/// Registry tag of the random walk estimator.
pub const RANDOM_WALK: &str = "random-walk";

/// Smallest along-road standard deviation used when splitting a prediction across edges.
const MIN_ROAD_STD: f64 = 1e-6;

/// Noise parameters shared by the motion and observation models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParameters {
    /// Diagonal of the GPS observation covariance, m²
    pub observation_variance: [f64; 2],
    /// Along-road acceleration variance, (m/s²)²
    pub on_road_acceleration_variance: f64,
    /// Ground acceleration variance per axis, (m/s²)²
    pub off_road_acceleration_variance: [f64; 2],
}
impl Default for MotionParameters {
    fn default() -> Self {
        MotionParameters {
            observation_variance: [25.0, 25.0],
            on_road_acceleration_variance: 6.25,
            off_road_acceleration_variance: [6.25, 6.25],
        }
    }
}
impl MotionParameters {
    pub fn observation_covariance(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_row_slice(&self.observation_variance))
    }
    pub fn validate(&self) -> Result<()> {
        let all = self
            .observation_variance
            .iter()
            .chain(self.off_road_acceleration_variance.iter())
            .chain(std::iter::once(&self.on_road_acceleration_variance));
        for v in all {
            if !v.is_finite() || *v <= 0.0 {
                return Err(TrackingError::InvalidConfig(format!(
                    "motion variances must be finite and positive, got {}",
                    v
                )));
            }
        }
        Ok(())
    }
}

/// Per-axis dynamics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dynamics {
    /// Position integrates velocity; velocity persists.
    ConstantVelocity,
    /// Position diffuses; velocity is re-drawn from the acceleration noise every step.
    RandomWalk,
}
impl Dynamics {
    fn axis_transition(&self, dt: f64) -> DMatrix<f64> {
        match self {
            Dynamics::ConstantVelocity => DMatrix::from_row_slice(2, 2, &[1.0, dt, 0.0, 1.0]),
            Dynamics::RandomWalk => DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]),
        }
    }
    fn axis_noise_jacobian(&self, dt: f64) -> DMatrix<f64> {
        DMatrix::from_column_slice(2, 1, &[0.5 * dt * dt, dt])
    }
}

/// Which linear model a belief follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionModel {
    /// Ground state `[x, vx, y, vy]`.
    FreeMotion,
    /// Road state `[s, v]`.
    RoadConstrained,
}
impl MotionModel {
    pub fn for_path(path: &Path) -> MotionModel {
        if path.is_null() {
            MotionModel::FreeMotion
        } else {
            MotionModel::RoadConstrained
        }
    }
    fn stack(&self, axis: DMatrix<f64>) -> DMatrix<f64> {
        match self {
            MotionModel::RoadConstrained => axis,
            MotionModel::FreeMotion => {
                let (r, c) = axis.shape();
                let mut block = DMatrix::zeros(2 * r, 2 * c);
                block.view_mut((0, 0), (r, c)).copy_from(&axis);
                block.view_mut((r, c), (r, c)).copy_from(&axis);
                block
            }
        }
    }
    pub fn transition_matrix(&self, dynamics: Dynamics, dt: f64) -> DMatrix<f64> {
        self.stack(dynamics.axis_transition(dt))
    }
    pub fn noise_jacobian(&self, dynamics: Dynamics, dt: f64) -> DMatrix<f64> {
        self.stack(dynamics.axis_noise_jacobian(dt))
    }
    pub fn acceleration_covariance(&self, parameters: &MotionParameters) -> DMatrix<f64> {
        match self {
            MotionModel::RoadConstrained => {
                DMatrix::from_element(1, 1, parameters.on_road_acceleration_variance)
            }
            MotionModel::FreeMotion => DMatrix::from_diagonal(&DVector::from_row_slice(
                &parameters.off_road_acceleration_variance,
            )),
        }
    }
    /// $Q = G \Sigma_a G^T$
    pub fn process_noise(
        &self,
        dynamics: Dynamics,
        dt: f64,
        parameters: &MotionParameters,
    ) -> DMatrix<f64> {
        let g = self.noise_jacobian(dynamics, dt);
        &g * self.acceleration_covariance(parameters) * g.transpose()
    }
}
impl Display for MotionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionModel::FreeMotion => write!(f, "free-motion"),
            MotionModel::RoadConstrained => write!(f, "road-constrained"),
        }
    }
}

/// A path prediction restricted to one edge, with the log-likelihood of the observation.
#[derive(Clone, Debug)]
pub struct EdgePrediction {
    pub belief: PathStateDistribution,
    pub log_likelihood: f64,
}

/// Motion and measurement capability used by the particle filter.
pub trait MotionStateEstimator: Debug + Send + Sync {
    /// Registry tag this estimator was built from.
    fn tag(&self) -> &'static str;

    fn parameters(&self) -> &MotionParameters;

    /// Propagate `prior`, expressed on `path`, forward by `dt` seconds.
    fn predict(&self, prior: &PathStateDistribution, path: &Path, dt: f64)
    -> PathStateDistribution;

    /// Restrict a path prediction to `edge` and score `observation` against it.
    ///
    /// `None` when the prediction puts no probability on the edge.
    fn edge_predictive(
        &self,
        predicted: &PathStateDistribution,
        edge: &PathEdge,
        observation: &Point2,
    ) -> Option<EdgePrediction>;

    /// Kalman measurement update with an observed position, keeping the result on `edge`.
    fn measure(
        &self,
        prior: &PathStateDistribution,
        observation: &Point2,
        edge: &PathEdge,
    ) -> PathStateDistribution;

    /// Draw a successor of `mean` from the process noise.
    fn sample_transition(&self, mean: &PathState, dt: f64, rng: &mut dyn RngCore) -> PathState;

    /// Log-density of `observation` under the belief's predicted position.
    fn observation_log_likelihood(
        &self,
        belief: &PathStateDistribution,
        observation: &Point2,
    ) -> f64;
}

/// Standard normal CDF.
fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// `ln P(lo <= X <= hi)` for `X ~ N(mean, std²)`, computed on the tail farther from the
/// mean to keep precision.
fn log_interval_mass(mean: f64, std: f64, lo: f64, hi: f64) -> f64 {
    let a = (lo - mean) / std;
    let b = (hi - mean) / std;
    let mass = if a > 0.0 {
        normal_cdf(-a) - normal_cdf(-b)
    } else {
        normal_cdf(b) - normal_cdf(a)
    };
    if mass > 0.0 { mass.ln() } else { f64::NEG_INFINITY }
}

/// Linear Gaussian tracker over free and road-constrained motion.
#[derive(Clone)]
pub struct RoadTrackingEstimator {
    tag: &'static str,
    dynamics: Dynamics,
    parameters: MotionParameters,
}
impl Debug for RoadTrackingEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoadTrackingEstimator")
            .field("tag", &self.tag)
            .field("dynamics", &self.dynamics)
            .field("observation_variance", &self.parameters.observation_variance)
            .field(
                "on_road_acceleration_variance",
                &self.parameters.on_road_acceleration_variance,
            )
            .field(
                "off_road_acceleration_variance",
                &self.parameters.off_road_acceleration_variance,
            )
            .finish()
    }
}
impl RoadTrackingEstimator {
    pub fn constant_velocity(parameters: MotionParameters) -> Self {
        RoadTrackingEstimator {
            tag: CONSTANT_VELOCITY,
            dynamics: Dynamics::ConstantVelocity,
            parameters,
        }
    }
    pub fn random_walk(parameters: MotionParameters) -> Self {
        RoadTrackingEstimator {
            tag: RANDOM_WALK,
            dynamics: Dynamics::RandomWalk,
            parameters,
        }
    }
    pub fn dynamics(&self) -> Dynamics {
        self.dynamics
    }

    /// Observation model at the belief's mean: expected position and Jacobian.
    fn observation_model(&self, belief: &PathStateDistribution) -> (DVector<f64>, DMatrix<f64>) {
        let og = position_selector();
        let mean = belief.mean();
        if mean.is_on_road() {
            let g = belief.path().road_to_ground_jacobian(mean.state()[0]);
            let ground = mean.ground_state();
            (&og * ground, &og * g)
        } else {
            (&og * mean.state(), og)
        }
    }
}
impl MotionStateEstimator for RoadTrackingEstimator {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn parameters(&self) -> &MotionParameters {
        &self.parameters
    }

    fn predict(
        &self,
        prior: &PathStateDistribution,
        path: &Path,
        dt: f64,
    ) -> PathStateDistribution {
        let on_path = prior.convert_to_path(path);
        let model = MotionModel::for_path(path);
        let f = model.transition_matrix(self.dynamics, dt);
        let q = model.process_noise(self.dynamics, dt, &self.parameters);
        let mean = &f * on_path.mean().state();
        let covariance = &f * on_path.covariance() * f.transpose() + q;
        PathStateDistribution::new(PathState::new(path.clone(), mean), symmetrize(&covariance))
    }

    /// On a road edge the weight is the predicted probability of lying on the edge times the
    /// observation density under the prediction clamped to the edge.
    fn edge_predictive(
        &self,
        predicted: &PathStateDistribution,
        edge: &PathEdge,
        observation: &Point2,
    ) -> Option<EdgePrediction> {
        if edge.is_null() {
            if predicted.is_on_road() {
                return None;
            }
            let log_likelihood = self.observation_log_likelihood(predicted, observation);
            return Some(EdgePrediction {
                belief: predicted.clone(),
                log_likelihood,
            });
        }
        if !predicted.is_on_road() {
            return None;
        }
        let mean = predicted.mean().state();
        let std = predicted.covariance()[(0, 0)].max(0.0).sqrt().max(MIN_ROAD_STD);
        let (lo, hi) = edge.distance_range();
        let log_mass = log_interval_mass(mean[0], std, lo, hi);
        if !log_mass.is_finite() {
            return None;
        }
        let on_edge = edge.checked_state_on_edge(mean, f64::INFINITY, false)?;
        let belief = PathStateDistribution::new(
            PathState::new(predicted.path().clone(), on_edge),
            predicted.covariance().clone(),
        );
        let log_likelihood = log_mass + self.observation_log_likelihood(&belief, observation);
        if log_likelihood.is_nan() || log_likelihood == f64::NEG_INFINITY {
            return None;
        }
        Some(EdgePrediction {
            belief,
            log_likelihood,
        })
    }

    fn measure(
        &self,
        prior: &PathStateDistribution,
        observation: &Point2,
        edge: &PathEdge,
    ) -> PathStateDistribution {
        let prior = match (edge.is_null(), prior.is_on_road()) {
            (true, true) => prior.convert_to_path(&Path::null()),
            (false, false) => {
                prior.convert_to_path(&Path::new(vec![edge.clone()], edge.is_backward()))
            }
            _ => prior.clone(),
        };
        let (z_hat, h) = self.observation_model(&prior);
        let p = prior.covariance();
        let s = &h * p * h.transpose() + self.parameters.observation_covariance();
        let hp = &h * p;
        let Some(kt) = robust_spd_solve(&s, &hp) else {
            warn!("singular innovation covariance; skipping measurement update");
            return prior;
        };
        let k = kt.transpose();
        let innovation = DVector::from_vec(vec![observation.x, observation.y]) - z_hat;
        let mut mean = prior.mean().state() + &k * innovation;
        let n = mean.len();
        let covariance = (DMatrix::identity(n, n) - &k * &h) * p;
        if !edge.is_null()
            && let Some(on_edge) = edge.checked_state_on_edge(&mean, f64::INFINITY, false)
        {
            mean = on_edge;
        }
        PathStateDistribution::new(
            PathState::new(prior.path().clone(), mean),
            symmetrize(&covariance),
        )
    }

    fn sample_transition(&self, mean: &PathState, dt: f64, rng: &mut dyn RngCore) -> PathState {
        let model = MotionModel::for_path(mean.path());
        let f = model.transition_matrix(self.dynamics, dt);
        let g = model.noise_jacobian(self.dynamics, dt);
        let sqrt_accel = matrix_square_root(&model.acceleration_covariance(&self.parameters));
        let z: DVector<f64> = DVector::from_iterator(
            sqrt_accel.ncols(),
            (0..sqrt_accel.ncols()).map(|_| StandardNormal.sample(&mut *rng)),
        );
        PathState::new(mean.path().clone(), &f * mean.state() + &g * (&sqrt_accel * z))
    }

    fn observation_log_likelihood(
        &self,
        belief: &PathStateDistribution,
        observation: &Point2,
    ) -> f64 {
        let (z_hat, h) = self.observation_model(belief);
        let s = &h * belief.covariance() * h.transpose() + self.parameters.observation_covariance();
        gaussian_log_pdf(&DVector::from_vec(vec![observation.x, observation.y]), &z_hat, &s)
    }
}

type EstimatorConstructor = fn(MotionParameters) -> Arc<dyn MotionStateEstimator>;

fn build_constant_velocity(parameters: MotionParameters) -> Arc<dyn MotionStateEstimator> {
    Arc::new(RoadTrackingEstimator::constant_velocity(parameters))
}

fn build_random_walk(parameters: MotionParameters) -> Arc<dyn MotionStateEstimator> {
    Arc::new(RoadTrackingEstimator::random_walk(parameters))
}

const REGISTRY: &[(&str, EstimatorConstructor)] = &[
    (CONSTANT_VELOCITY, build_constant_velocity),
    (RANDOM_WALK, build_random_walk),
];

/// Tags accepted by [`estimator_from_tag`].
pub fn registered_estimators() -> Vec<&'static str> {
    REGISTRY.iter().map(|(tag, _)| *tag).collect()
}

/// Build the motion estimator registered under `tag`.
pub fn estimator_from_tag(
    tag: &str,
    parameters: MotionParameters,
) -> Result<Arc<dyn MotionStateEstimator>> {
    parameters.validate()?;
    REGISTRY
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, construct)| construct(parameters))
        .ok_or_else(|| TrackingError::UnknownEstimator(tag.to_string()))
}
