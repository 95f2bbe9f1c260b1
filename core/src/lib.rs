//! ROADTRACK-RS: road-network constrained vehicle tracking with a particle-learning filter.
//!
//! Each incoming GPS fix updates a population of weighted hypotheses ("particles") about the
//! vehicle's road-relative location, its motion state, and its probability of being on or off
//! the road network. The pieces are, leaf first:
//!
//! - [`path`]: directed spans of road edges ([`path::PathEdge`]) and chains of them
//!   ([`path::Path`]), including the null path that stands for free (off-road) motion.
//! - [`state`]: road-coordinate or ground-coordinate states attached to a path, and Gaussian
//!   beliefs over them.
//! - [`transition`]: the conjugate Dirichlet-Multinomial estimator of on/off-road transitions.
//! - [`mixture`]: log-weighted mixtures of path-state beliefs used to summarise a population.
//! - [`kalman`]: the free-motion and road-constrained motion/measurement models.
//! - [`graph`]: the road-network collaborator and a small in-memory implementation.
//! - [`particle`] and [`filter`]: the particle population, resampling, and the
//!   predict/weight/resample/propagate cycle.
//! - [`sim`]: CSV input/output, run configuration and a trajectory simulator used by the CLI.
//!
//! All positions inside the filter live in a local tangent plane measured in meters
//! (x east, y north). Raw WGS84 fixes are mapped onto that plane by a [`LocalProjection`].
//! Ground states are ordered `[x, vx, y, vy]`; road states are `[s, v]` where `s` is the
//! signed distance along the owning path.
pub mod earth;
pub mod error;
pub mod filter;
pub mod graph;
pub mod kalman;
pub mod linalg;
pub mod mixture;
pub mod particle;
pub mod path;
pub mod sim;
pub mod state;
pub mod transition;

use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub use error::{Result, TrackingError};

/// A point in the local tangent plane, in meters (x east, y north).
pub type Point2 = Vector2<f64>;

/// Largest distance from the projection origin that is accepted, in meters. The flat-earth
/// approximation degrades quickly beyond a few hundred kilometers.
pub const MAX_PROJECTION_RANGE: f64 = 200_000.0;

/// A WGS84 coordinate in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}
impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoCoordinate {
            latitude,
            longitude,
        }
    }
}
impl Display for GeoCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.7}, {:.7})", self.latitude, self.longitude)
    }
}

/// Local tangent-plane projection around a fixed origin.
///
/// Uses the meridian and transverse radii of curvature at the origin latitude, which is
/// accurate to well under a meter over the extent of a city.
///
/// # Example
/// ```rust
/// use roadtrack::{GeoCoordinate, LocalProjection};
/// let projection = LocalProjection::new(GeoCoordinate::new(40.0, -105.0));
/// let point = projection.project(&GeoCoordinate::new(40.001, -105.0)).unwrap();
/// assert!(point.x.abs() < 1e-9);
/// assert!((point.y - 111.0).abs() < 1.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalProjection {
    origin: GeoCoordinate,
    meridian_radius: f64,
    parallel_radius: f64,
}
impl LocalProjection {
    pub fn new(origin: GeoCoordinate) -> Self {
        let (r_n, _r_e, r_p) = earth::principal_radii(&origin.latitude, &0.0);
        LocalProjection {
            origin,
            meridian_radius: r_n,
            parallel_radius: r_p,
        }
    }
    pub fn origin(&self) -> GeoCoordinate {
        self.origin
    }
    /// Map a WGS84 coordinate onto the local plane.
    ///
    /// Fails with [`TrackingError::Projection`] for non-finite or out of range coordinates and
    /// for points further than [`MAX_PROJECTION_RANGE`] from the origin.
    pub fn project(&self, coordinate: &GeoCoordinate) -> Result<Point2> {
        let fail = |reason: &str| TrackingError::Projection {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            reason: reason.to_string(),
        };
        if !coordinate.latitude.is_finite() || !coordinate.longitude.is_finite() {
            return Err(fail("coordinate is not finite"));
        }
        if coordinate.latitude.abs() > 90.0 || coordinate.longitude.abs() > 180.0 {
            return Err(fail("coordinate outside WGS84 bounds"));
        }
        if self.parallel_radius <= 0.0 {
            return Err(fail("projection origin is at a pole"));
        }
        let mut d_lon = coordinate.longitude - self.origin.longitude;
        if d_lon > 180.0 {
            d_lon -= 360.0;
        } else if d_lon < -180.0 {
            d_lon += 360.0;
        }
        let x = d_lon.to_radians() * self.parallel_radius;
        let y = (coordinate.latitude - self.origin.latitude).to_radians() * self.meridian_radius;
        let point = Point2::new(x, y);
        if point.norm() > MAX_PROJECTION_RANGE {
            return Err(fail("coordinate too far from projection origin"));
        }
        Ok(point)
    }
    /// Inverse of [`LocalProjection::project`].
    pub fn unproject(&self, point: &Point2) -> GeoCoordinate {
        GeoCoordinate {
            latitude: self.origin.latitude + (point.y / self.meridian_radius).to_degrees(),
            longitude: self.origin.longitude + (point.x / self.parallel_radius).to_degrees(),
        }
    }
}

/// A single GPS fix: timestamp, raw coordinate and its projection onto the local plane.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub coordinate: GeoCoordinate,
    pub projected: Point2,
}
impl Observation {
    /// Build an observation by projecting a raw fix.
    pub fn new(
        time: DateTime<Utc>,
        coordinate: GeoCoordinate,
        projection: &LocalProjection,
    ) -> Result<Self> {
        let projected = projection.project(&coordinate)?;
        Ok(Observation {
            time,
            coordinate,
            projected,
        })
    }
    /// Build an observation from a point already on the local plane.
    pub fn from_projected(
        time: DateTime<Utc>,
        projected: Point2,
        projection: &LocalProjection,
    ) -> Self {
        Observation {
            time,
            coordinate: projection.unproject(&projected),
            projected,
        }
    }
    /// Seconds elapsed since `earlier`. Negative when `earlier` is in the future.
    pub fn seconds_since(&self, earlier: &Observation) -> f64 {
        (self.time - earlier.time).num_microseconds().unwrap_or(0) as f64 * 1e-6
    }
}
impl Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Observation {{ time: {}, coordinate: {}, projected: [{:.2}, {:.2}] }}",
            self.time.to_rfc3339(),
            self.coordinate,
            self.projected.x,
            self.projected.y
        )
    }
}
