//! Path-relative vehicle states and Gaussian beliefs over them.
//!
//! A [`PathState`] on a road path is the two-vector `[s, v]` (signed distance along the path
//! and speed along it). On the null path it is the ground four-vector `[x, vx, y, vy]`. The
//! two representations are tied together by the fixed selectors below and by the per-edge
//! Jacobian returned from [`Path::road_to_ground_jacobian`].
use crate::Point2;
use crate::linalg::{gaussian_log_pdf, symmetrize};
use crate::path::{EDGE_EPSILON, Path, PathEdge};

use nalgebra::{DMatrix, DVector};
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// Dimension of a ground state `[x, vx, y, vy]`.
pub const GROUND_DIM: usize = 4;
/// Dimension of a road state `[s, v]`.
pub const ROAD_DIM: usize = 2;

/// Selects the position `[x, y]` out of a ground state.
pub fn position_selector() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
}

/// Selects the velocity `[vx, vy]` out of a ground state.
pub fn velocity_selector() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 4, &[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])
}

/// Hash float content so that `0.0` and `-0.0` agree, matching `==`.
pub(crate) fn hash_floats<'a, H: Hasher>(values: impl Iterator<Item = &'a f64>, state: &mut H) {
    for v in values {
        (v + 0.0).to_bits().hash(state);
    }
}

/// A state vector together with the path it is expressed on.
#[derive(Clone, Debug)]
pub struct PathState {
    path: Path,
    state: DVector<f64>,
}
impl PathState {
    /// # Panics
    /// If the dimension does not match the path: two on a road path, four on the null path.
    pub fn new(path: Path, state: DVector<f64>) -> PathState {
        let expected = if path.is_null() { GROUND_DIM } else { ROAD_DIM };
        assert_eq!(
            state.len(),
            expected,
            "state dimension does not match its path"
        );
        PathState { path, state }
    }
    /// Express a ground state on `path`.
    pub fn from_ground(path: Path, ground_state: &DVector<f64>) -> PathState {
        let state = path.ground_to_road(ground_state);
        PathState { path, state }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }
    pub fn is_on_road(&self) -> bool {
        !self.path.is_null()
    }
    /// The edge holding the current position, clamped to the path.
    pub fn edge(&self) -> PathEdge {
        if !self.is_on_road() {
            return PathEdge::null();
        }
        let distance = self.path.clamp_distance(self.state[0]);
        self.path
            .edge_for_distance(distance, EDGE_EPSILON)
            .unwrap_or_else(|| self.path.last_edge())
            .clone()
    }
    pub fn ground_state(&self) -> DVector<f64> {
        self.path.road_to_ground(&self.state)
    }
    pub fn ground_position(&self) -> Point2 {
        let ground = self.ground_state();
        Point2::new(ground[0], ground[2])
    }
    /// The same physical state expressed on another path.
    pub fn convert_to_path(&self, path: &Path) -> PathState {
        if &self.path == path {
            return self.clone();
        }
        PathState::from_ground(path.clone(), &self.ground_state())
    }
}
impl PartialEq for PathState {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.state == other.state
    }
}
impl Eq for PathState {}
impl Hash for PathState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        hash_floats(self.state.iter(), state);
    }
}
impl Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.state.iter().map(|v| format!("{:.3}", v)).collect();
        write!(f, "PathState [{}, state=[{}]]", self.path, values.join(", "))
    }
}

/// A Gaussian belief over a [`PathState`].
#[derive(Clone, Debug)]
pub struct PathStateDistribution {
    mean: PathState,
    covariance: DMatrix<f64>,
}
impl PathStateDistribution {
    pub fn new(mean: PathState, covariance: DMatrix<f64>) -> PathStateDistribution {
        let n = mean.state().len();
        assert_eq!(
            covariance.shape(),
            (n, n),
            "covariance dimension does not match the mean"
        );
        PathStateDistribution {
            mean,
            covariance: symmetrize(&covariance),
        }
    }
    pub fn mean(&self) -> &PathState {
        &self.mean
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn path(&self) -> &Path {
        self.mean.path()
    }
    pub fn edge(&self) -> PathEdge {
        self.mean.edge()
    }
    pub fn is_on_road(&self) -> bool {
        self.mean.is_on_road()
    }

    /// Mean and covariance in ground coordinates.
    ///
    /// A road belief maps through the local road-to-ground Jacobian, which leaves the ground
    /// covariance rank deficient across the road.
    pub fn ground_belief(&self) -> (DVector<f64>, DMatrix<f64>) {
        if !self.is_on_road() {
            return (self.mean.state().clone(), self.covariance.clone());
        }
        let g = self.path().road_to_ground_jacobian(self.mean.state()[0]);
        let covariance = &g * &self.covariance * g.transpose();
        (self.mean.ground_state(), symmetrize(&covariance))
    }

    /// The same belief expressed on another path.
    pub fn convert_to_path(&self, path: &Path) -> PathStateDistribution {
        if self.path() == path {
            return self.clone();
        }
        let (ground_mean, ground_cov) = self.ground_belief();
        if path.is_null() {
            return PathStateDistribution::new(
                PathState::new(path.clone(), ground_mean),
                ground_cov,
            );
        }
        let mean = PathState::from_ground(path.clone(), &ground_mean);
        let g = path.road_to_ground_jacobian(mean.state()[0]);
        let covariance = g.transpose() * ground_cov * &g;
        PathStateDistribution::new(mean, covariance)
    }

    pub fn log_evaluate(&self, value: &PathState) -> f64 {
        let x = value.convert_to_path(self.path());
        gaussian_log_pdf(x.state(), self.mean.state(), &self.covariance)
    }

    pub fn evaluate(&self, value: &PathState) -> f64 {
        self.log_evaluate(value).exp()
    }
}
impl PartialEq for PathStateDistribution {
    fn eq(&self, other: &Self) -> bool {
        self.mean == other.mean && self.covariance == other.covariance
    }
}
impl Eq for PathStateDistribution {}
impl Hash for PathStateDistribution {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mean.hash(state);
        hash_floats(self.covariance.iter(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::tests::straight_edge;
    use assert_approx_eq::assert_approx_eq;

    fn l_path() -> Path {
        Path::from_road_edges(
            &[
                straight_edge(1, (0.0, 0.0), (100.0, 0.0)),
                straight_edge(2, (100.0, 0.0), (100.0, 80.0)),
            ],
            false,
        )
    }

    #[test]
    fn test_selectors() {
        let ground = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(position_selector() * &ground, DVector::from_vec(vec![1.0, 3.0]));
        assert_eq!(velocity_selector() * &ground, DVector::from_vec(vec![2.0, 4.0]));
    }

    #[test]
    fn test_ground_road_round_trip() {
        let path = l_path();
        for ground in [
            DVector::from_vec(vec![40.0, 12.0, 0.0, 0.0]),
            DVector::from_vec(vec![100.0, 0.0, 35.0, -3.0]),
        ] {
            let state = PathState::from_ground(path.clone(), &ground);
            assert!(state.is_on_road());
            let back = state.ground_state();
            for i in 0..4 {
                assert_approx_eq!(back[i], ground[i], 1e-10);
            }
        }
        let state = PathState::from_ground(path.clone(), &DVector::from_vec(vec![100.0, 0.0, 35.0, -3.0]));
        assert_approx_eq!(state.state()[0], 135.0, 1e-10);
        assert_approx_eq!(state.state()[1], -3.0, 1e-10);
        assert_eq!(state.edge().edge().id(), Some(2));
    }

    #[test]
    #[should_panic(expected = "state dimension")]
    fn test_dimension_mismatch_panics() {
        PathState::new(Path::null(), DVector::zeros(2));
    }

    #[test]
    fn test_distribution_conversion_preserves_density_peak() {
        let path = l_path();
        let mean = PathState::new(path.clone(), DVector::from_vec(vec![50.0, 10.0]));
        let belief = PathStateDistribution::new(
            mean.clone(),
            DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 1.0])),
        );
        let (ground_mean, ground_cov) = belief.ground_belief();
        assert_approx_eq!(ground_mean[0], 50.0, 1e-12);
        assert_approx_eq!(ground_mean[1], 10.0, 1e-12);
        assert_approx_eq!(ground_cov[(0, 0)], 4.0, 1e-12);
        assert_approx_eq!(ground_cov[(2, 2)], 0.0, 1e-12);

        let on_other = belief.convert_to_path(&Path::from_road_edges(
            &[straight_edge(1, (0.0, 0.0), (100.0, 0.0))],
            false,
        ));
        assert_approx_eq!(on_other.mean().state()[0], 50.0, 1e-12);
        assert_approx_eq!(on_other.covariance()[(0, 0)], 4.0, 1e-12);

        let peak = belief.log_evaluate(&mean);
        let expected = -0.5 * (2.0 * (2.0 * std::f64::consts::PI).ln() + 4.0_f64.ln());
        assert_approx_eq!(peak, expected, 1e-12);
        let off_peak = PathState::new(path, DVector::from_vec(vec![52.0, 10.0]));
        assert!(belief.evaluate(&off_peak) < belief.evaluate(&mean));
    }

    #[test]
    fn test_free_belief_is_ground() {
        let mean = PathState::new(Path::null(), DVector::from_vec(vec![1.0, 0.0, 2.0, 0.0]));
        let belief = PathStateDistribution::new(mean, DMatrix::identity(4, 4));
        assert!(!belief.is_on_road());
        assert!(belief.edge().is_null());
        assert_eq!(belief.ground_belief().1, DMatrix::identity(4, 4));
    }
}
