//! Road edges, directed spans of edges within a path, and paths.
//!
//! Path coordinates are signed: a forward path starts at distance zero and grows positive, a
//! backward path starts at zero and grows negative. A [`PathEdge`] records where its edge
//! begins on the owning path (`distance_to_start`, never positive on a backward path), so the
//! offset of a path distance `s` from the start of the edge geometry is
//! `direction * s - |distance_to_start|`.
//!
//! The null edge and the null path carry no geometry. They stand for free (off-road) motion,
//! in which case states are expressed in ground coordinates `[x, vx, y, vy]` instead.
use crate::Point2;

use nalgebra::{DMatrix, DVector, Vector2};
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Slack used by exact containment checks.
pub const EDGE_EPSILON: f64 = 1e-7;

pub type EdgeId = u64;

/// A directed road segment described by a polyline in the local plane.
#[derive(Clone, Debug)]
pub struct RoadEdge {
    id: EdgeId,
    geometry: Vec<Point2>,
    cumulative: Vec<f64>,
}
impl RoadEdge {
    pub fn new(id: EdgeId, geometry: Vec<Point2>) -> RoadEdge {
        assert!(
            geometry.len() >= 2,
            "RoadEdge geometry needs at least two points"
        );
        let mut cumulative = Vec::with_capacity(geometry.len());
        cumulative.push(0.0);
        for pair in geometry.windows(2) {
            let last = cumulative[cumulative.len() - 1];
            cumulative.push(last + (pair[1] - pair[0]).norm());
        }
        assert!(
            cumulative[cumulative.len() - 1] > 0.0,
            "RoadEdge geometry must have positive length"
        );
        RoadEdge {
            id,
            geometry,
            cumulative,
        }
    }
    pub fn id(&self) -> EdgeId {
        self.id
    }
    pub fn geometry(&self) -> &[Point2] {
        &self.geometry
    }
    pub fn length(&self) -> f64 {
        self.cumulative[self.cumulative.len() - 1]
    }
    pub fn start(&self) -> Point2 {
        self.geometry[0]
    }
    pub fn end(&self) -> Point2 {
        self.geometry[self.geometry.len() - 1]
    }
    /// Index of the segment holding `offset` (clamped to the edge).
    fn segment_at(&self, offset: f64) -> usize {
        let last = self.geometry.len() - 2;
        (0..=last)
            .find(|&i| offset <= self.cumulative[i + 1] && self.cumulative[i + 1] > self.cumulative[i])
            .unwrap_or(last)
    }
    /// Point at `offset` meters from the start of the geometry, clamped to the edge.
    pub fn point_at(&self, offset: f64) -> Point2 {
        let offset = offset.clamp(0.0, self.length());
        let i = self.segment_at(offset);
        let seg_len = self.cumulative[i + 1] - self.cumulative[i];
        if seg_len <= 0.0 {
            return self.geometry[i];
        }
        let frac = (offset - self.cumulative[i]) / seg_len;
        self.geometry[i] + (self.geometry[i + 1] - self.geometry[i]) * frac
    }
    /// Unit tangent of the geometry at `offset`.
    pub fn tangent_at(&self, offset: f64) -> Vector2<f64> {
        let i = self.segment_at(offset.clamp(0.0, self.length()));
        let delta = self.geometry[i + 1] - self.geometry[i];
        let norm = delta.norm();
        if norm > 0.0 {
            delta / norm
        } else {
            let overall = self.end() - self.start();
            overall / overall.norm().max(f64::MIN_POSITIVE)
        }
    }
    /// Orthogonal projection of `point` onto the geometry.
    ///
    /// Returns the offset along the edge of the closest point and the distance to it.
    pub fn project(&self, point: &Point2) -> (f64, f64) {
        let mut best = (0.0, f64::INFINITY);
        for (i, pair) in self.geometry.windows(2).enumerate() {
            let delta = pair[1] - pair[0];
            let seg_len_sq = delta.norm_squared();
            let frac = if seg_len_sq > 0.0 {
                ((point - pair[0]).dot(&delta) / seg_len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let closest = pair[0] + delta * frac;
            let distance = (point - closest).norm();
            if distance < best.1 {
                let seg_len = self.cumulative[i + 1] - self.cumulative[i];
                best = (self.cumulative[i] + frac * seg_len, distance);
            }
        }
        best
    }
}
impl PartialEq for RoadEdge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for RoadEdge {}
impl Hash for RoadEdge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Either free motion or a specific road edge.
#[derive(Clone, Debug, Default)]
pub enum InferredEdge {
    #[default]
    Free,
    Road(Arc<RoadEdge>),
}
impl InferredEdge {
    pub fn is_free(&self) -> bool {
        matches!(self, InferredEdge::Free)
    }
    pub fn id(&self) -> Option<EdgeId> {
        match self {
            InferredEdge::Free => None,
            InferredEdge::Road(edge) => Some(edge.id()),
        }
    }
    pub fn road(&self) -> Option<&Arc<RoadEdge>> {
        match self {
            InferredEdge::Free => None,
            InferredEdge::Road(edge) => Some(edge),
        }
    }
    /// Zero for free motion.
    pub fn length(&self) -> f64 {
        self.road().map_or(0.0, |edge| edge.length())
    }
}
impl From<Arc<RoadEdge>> for InferredEdge {
    fn from(edge: Arc<RoadEdge>) -> Self {
        InferredEdge::Road(edge)
    }
}
impl PartialEq for InferredEdge {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
impl Eq for InferredEdge {}
impl Hash for InferredEdge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
impl PartialOrd for InferredEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for InferredEdge {
    /// Road edges by id, free motion last.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}
impl Display for InferredEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferredEdge::Free => write!(f, "free"),
            InferredEdge::Road(edge) => write!(f, "edge {} ({:.1} m)", edge.id(), edge.length()),
        }
    }
}

/// A directed span of a single road edge within a path.
#[derive(Clone, Debug, Default)]
pub struct PathEdge {
    edge: InferredEdge,
    distance_to_start: f64,
    is_backward: bool,
}
impl PathEdge {
    /// # Panics
    /// If `is_backward` is set while `distance_to_start` is positive, or the distance is not
    /// finite.
    pub fn new(edge: Arc<RoadEdge>, distance_to_start: f64, is_backward: bool) -> PathEdge {
        assert!(
            distance_to_start.is_finite(),
            "PathEdge distance to start must be finite"
        );
        assert!(
            !is_backward || distance_to_start <= 0.0,
            "backward PathEdge must have a non-positive distance to start, got {}",
            distance_to_start
        );
        PathEdge {
            edge: InferredEdge::Road(edge),
            distance_to_start,
            is_backward,
        }
    }
    /// The edge of free motion.
    pub fn null() -> PathEdge {
        PathEdge::default()
    }
    pub fn is_null(&self) -> bool {
        self.edge.is_free()
    }
    pub fn edge(&self) -> &InferredEdge {
        &self.edge
    }
    pub fn road_edge(&self) -> Option<&Arc<RoadEdge>> {
        self.edge.road()
    }
    pub fn distance_to_start(&self) -> f64 {
        self.distance_to_start
    }
    pub fn is_backward(&self) -> bool {
        self.is_backward
    }
    pub fn direction(&self) -> f64 {
        if self.is_backward { -1.0 } else { 1.0 }
    }
    pub fn length(&self) -> f64 {
        self.edge.length()
    }
    /// Offset from the start of the edge geometry for a path distance.
    pub fn offset_of(&self, distance: f64) -> f64 {
        self.direction() * distance - self.distance_to_start.abs()
    }
    /// Path distance of an offset from the start of the edge geometry.
    pub fn distance_of(&self, offset: f64) -> f64 {
        self.direction() * (offset + self.distance_to_start.abs())
    }
    /// Path distances covered by this edge, as `(low, high)`.
    pub fn distance_range(&self) -> (f64, f64) {
        let a = self.distance_of(0.0);
        let b = self.distance_of(self.length());
        if a <= b { (a, b) } else { (b, a) }
    }

    /// Fit a road state `[s, v]` onto this edge.
    ///
    /// Returns `None` when the position overshoots either end of the edge by more than
    /// `tolerance`. Otherwise the position is clamped to the edge and expressed in path
    /// coordinates, or relative to the start of this edge when `relative` is set.
    ///
    /// # Panics
    /// On the null edge, a negative tolerance, or a state that is not two-dimensional.
    pub fn checked_state_on_edge(
        &self,
        state: &DVector<f64>,
        tolerance: f64,
        relative: bool,
    ) -> Option<DVector<f64>> {
        assert!(!self.is_null(), "the null edge has no geometry");
        assert!(tolerance >= 0.0, "tolerance must be non-negative");
        assert_eq!(state.len(), 2, "road states are [distance, velocity]");

        let direction = self.direction();
        let length = self.length();
        let offset = self.offset_of(state[0]);
        if offset - length > tolerance || offset < -tolerance {
            return None;
        }
        let clamped = offset.clamp(0.0, length);
        let mut fitted = state.clone();
        fitted[0] = direction * clamped + if relative { 0.0 } else { self.distance_to_start };
        Some(fitted)
    }

    /// Whether a path distance falls on this edge. Always false for the null edge.
    pub fn contains_distance(&self, distance: f64) -> bool {
        if self.is_null() {
            return false;
        }
        let offset = self.offset_of(distance);
        !(offset - self.length() > EDGE_EPSILON || offset < 0.0)
    }

    fn distance_key(&self) -> u64 {
        (self.distance_to_start + 0.0).to_bits()
    }
}
impl PartialEq for PathEdge {
    fn eq(&self, other: &Self) -> bool {
        self.edge == other.edge
            && self.is_backward == other.is_backward
            && self.distance_to_start == other.distance_to_start
    }
}
impl Eq for PathEdge {}
impl Hash for PathEdge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.edge.hash(state);
        self.is_backward.hash(state);
        self.distance_key().hash(state);
    }
}
impl PartialOrd for PathEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PathEdge {
    /// By edge, then direction, then distance to start. Only the null edge lacks the latter
    /// two, and it already sorts after every road edge.
    fn cmp(&self, other: &Self) -> Ordering {
        self.edge
            .cmp(&other.edge)
            .then(self.is_backward.cmp(&other.is_backward))
            .then((self.distance_to_start + 0.0).total_cmp(&(other.distance_to_start + 0.0)))
    }
}
impl Display for PathEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PathEdge [empty edge]")
        } else {
            write!(
                f,
                "PathEdge [{}, distToStart={:.1}{}]",
                self.edge,
                self.distance_to_start,
                if self.is_backward { ", backward" } else { "" }
            )
        }
    }
}

/// An ordered chain of path edges, or the null path of free motion.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    edges: Vec<PathEdge>,
    is_backward: bool,
}
impl Default for Path {
    fn default() -> Self {
        Path::null()
    }
}
impl Path {
    /// The single-edge path holding only the null edge.
    pub fn null() -> Path {
        Path {
            edges: vec![PathEdge::null()],
            is_backward: false,
        }
    }

    /// # Panics
    /// If `edges` is empty, mixes the null edge with road edges, disagrees with
    /// `is_backward`, or is not contiguous in path distance.
    pub fn new(edges: Vec<PathEdge>, is_backward: bool) -> Path {
        assert!(!edges.is_empty(), "a path needs at least one edge");
        if edges.iter().any(PathEdge::is_null) {
            assert_eq!(edges.len(), 1, "the null edge only appears in the null path");
            return Path::null();
        }
        for pair in edges.windows(2) {
            let expected = pair[0].distance_to_start() + pair[0].direction() * pair[0].length();
            assert!(
                (pair[1].distance_to_start() - expected).abs() < 1e-6,
                "path edges must be contiguous"
            );
        }
        assert!(
            edges.iter().all(|e| e.is_backward() == is_backward),
            "path edges must share the path's direction"
        );
        Path { edges, is_backward }
    }

    /// Chain road edges into a path starting at distance zero.
    pub fn from_road_edges(road_edges: &[Arc<RoadEdge>], is_backward: bool) -> Path {
        let direction = if is_backward { -1.0 } else { 1.0 };
        let mut distance = 0.0;
        let mut edges = Vec::with_capacity(road_edges.len());
        for edge in road_edges {
            edges.push(PathEdge::new(edge.clone(), distance, is_backward));
            distance += direction * edge.length();
        }
        Path::new(edges, is_backward)
    }

    pub fn is_null(&self) -> bool {
        self.edges[0].is_null()
    }
    pub fn edges(&self) -> &[PathEdge] {
        &self.edges
    }
    pub fn first_edge(&self) -> &PathEdge {
        &self.edges[0]
    }
    pub fn last_edge(&self) -> &PathEdge {
        &self.edges[self.edges.len() - 1]
    }
    pub fn is_backward(&self) -> bool {
        self.is_backward
    }
    pub fn direction(&self) -> f64 {
        if self.is_backward { -1.0 } else { 1.0 }
    }
    /// Signed distance at the end of the path.
    pub fn total_distance(&self) -> f64 {
        if self.is_null() {
            return 0.0;
        }
        let last = self.last_edge();
        last.distance_to_start() + last.direction() * last.length()
    }
    /// Sum of edge lengths. Zero for the null path.
    pub fn length(&self) -> f64 {
        self.edges.iter().map(PathEdge::length).sum()
    }
    /// Clamp a path distance to the extent of the path.
    pub fn clamp_distance(&self, distance: f64) -> f64 {
        let end = self.total_distance();
        let (lo, hi) = if end >= 0.0 { (0.0, end) } else { (end, 0.0) };
        distance.clamp(lo, hi)
    }

    /// The edge a path distance falls on.
    ///
    /// The first edge containing the distance wins; a distance past either end of the path by
    /// no more than `tolerance` maps to the nearest end edge. The null path always answers
    /// with the null edge.
    pub fn edge_for_distance(&self, distance: f64, tolerance: f64) -> Option<&PathEdge> {
        if self.is_null() {
            return Some(&self.edges[0]);
        }
        if let Some(edge) = self.edges.iter().find(|e| e.contains_distance(distance)) {
            return Some(edge);
        }
        let state = DVector::from_vec(vec![distance, 0.0]);
        [self.first_edge(), self.last_edge()]
            .into_iter()
            .find(|e| e.checked_state_on_edge(&state, tolerance, false).is_some())
    }

    /// Jacobian of ground `[x, vx, y, vy]` with respect to road `[s, v]` at path distance `s`.
    pub fn road_to_ground_jacobian(&self, distance: f64) -> DMatrix<f64> {
        let (edge, offset) = self.locate(distance);
        let d = edge.direction();
        let u = edge
            .road_edge()
            .map_or(Vector2::new(1.0, 0.0), |road| road.tangent_at(offset));
        DMatrix::from_row_slice(
            4,
            2,
            &[d * u.x, 0.0, 0.0, d * u.x, d * u.y, 0.0, 0.0, d * u.y],
        )
    }

    /// Edge and geometry offset for a path distance, clamped to the path.
    fn locate(&self, distance: f64) -> (&PathEdge, f64) {
        let clamped = self.clamp_distance(distance);
        let edge = self
            .edge_for_distance(clamped, EDGE_EPSILON)
            .unwrap_or_else(|| self.last_edge());
        let offset = edge.offset_of(clamped).clamp(0.0, edge.length());
        (edge, offset)
    }

    /// Convert a road state `[s, v]` on this path into a ground state `[x, vx, y, vy]`.
    ///
    /// Positions beyond the path are clamped to its ends. On the null path the state is
    /// already in ground coordinates and is returned unchanged.
    pub fn road_to_ground(&self, road_state: &DVector<f64>) -> DVector<f64> {
        if self.is_null() {
            assert_eq!(road_state.len(), 4, "null path states are ground states");
            return road_state.clone();
        }
        assert_eq!(road_state.len(), 2, "road states are [distance, velocity]");
        let (edge, offset) = self.locate(road_state[0]);
        let Some(road) = edge.road_edge() else {
            return DVector::zeros(4);
        };
        let p = road.point_at(offset);
        let velocity = road.tangent_at(offset) * (edge.direction() * road_state[1]);
        DVector::from_vec(vec![p.x, velocity.x, p.y, velocity.y])
    }

    /// Project a ground state `[x, vx, y, vy]` onto this path as a road state `[s, v]`.
    ///
    /// The position snaps to the closest point of the closest edge and the velocity keeps its
    /// component along the local tangent. On the null path the ground state is returned.
    pub fn ground_to_road(&self, ground_state: &DVector<f64>) -> DVector<f64> {
        assert_eq!(ground_state.len(), 4, "ground states are [x, vx, y, vy]");
        if self.is_null() {
            return ground_state.clone();
        }
        let point = Point2::new(ground_state[0], ground_state[2]);
        let velocity = Vector2::new(ground_state[1], ground_state[3]);
        let mut best: Option<(&PathEdge, f64, f64)> = None;
        for edge in &self.edges {
            if let Some(road) = edge.road_edge() {
                let (offset, distance) = road.project(&point);
                if best.is_none_or(|(_, _, d)| distance < d) {
                    best = Some((edge, offset, distance));
                }
            }
        }
        match best {
            Some((edge, offset, _)) => {
                let tangent = edge.road_edge().map_or(Vector2::zeros(), |r| r.tangent_at(offset));
                DVector::from_vec(vec![
                    edge.distance_of(offset),
                    edge.direction() * tangent.dot(&velocity),
                ])
            }
            None => DVector::zeros(2),
        }
    }
}
impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Path [null]");
        }
        let ids: Vec<String> = self
            .edges
            .iter()
            .filter_map(|e| e.edge().id())
            .map(|id| id.to_string())
            .collect();
        write!(
            f,
            "Path [edges=[{}], dist={:.1}]",
            ids.join(", "),
            self.total_distance()
        )
    }
}
