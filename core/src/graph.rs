//! Road network collaborator.
//!
//! The filter only needs three things from a road network: the edges near a point, the
//! candidate paths a particle may have followed to reach a new observation, and the
//! position of a point along an edge. [`RoadNetwork`] captures that contract.
//! [`SimpleRoadGraph`] is a small in-memory implementation: directed polyline edges joined
//! at shared end points, searched depth-first.
use crate::path::{EdgeId, Path, RoadEdge};
use crate::state::PathStateDistribution;
use crate::{Observation, Point2};

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// End points closer than this are the same node, in meters.
const NODE_SNAP_DISTANCE: f64 = 1e-3;

/// Limits of the candidate path search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSearchParameters {
    /// Radius around a position within which edges count as nearby, m
    pub nearby_radius: f64,
    /// Longest distance travelled beyond the starting position, m
    pub max_distance: f64,
    /// Most edges in a single path
    pub max_edges: usize,
}
impl Default for PathSearchParameters {
    fn default() -> Self {
        PathSearchParameters {
            nearby_radius: 30.0,
            max_distance: 500.0,
            max_edges: 12,
        }
    }
}

/// Road network queries consumed by the filter. Implementations are shared read-only by all
/// particles.
pub trait RoadNetwork: Send + Sync {
    fn edge(&self, id: EdgeId) -> Option<Arc<RoadEdge>>;

    /// Edges whose geometry passes within `radius` of `point`, closest first.
    fn nearby_edges(&self, point: &Point2, radius: f64) -> Vec<Arc<RoadEdge>>;

    /// Candidate paths from `belief` towards `observation`. The null path is always included.
    fn paths(
        &self,
        belief: &PathStateDistribution,
        observation: &Observation,
        search: &PathSearchParameters,
    ) -> Vec<Path>;

    /// Offset along `edge` of the closest point to `point`.
    fn length_along_edge(&self, edge: &RoadEdge, point: &Point2) -> f64 {
        edge.project(point).0
    }
}

/// In-memory directed road graph.
#[derive(Clone, Debug, Default)]
pub struct SimpleRoadGraph {
    edges: BTreeMap<EdgeId, Arc<RoadEdge>>,
    nodes: Vec<Point2>,
    edge_nodes: HashMap<EdgeId, (usize, usize)>,
    outgoing: HashMap<usize, Vec<EdgeId>>,
}
impl SimpleRoadGraph {
    pub fn new() -> Self {
        SimpleRoadGraph::default()
    }
    pub fn len(&self) -> usize {
        self.edges.len()
    }
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
    pub fn edges(&self) -> impl Iterator<Item = &Arc<RoadEdge>> {
        self.edges.values()
    }

    fn node_for(&mut self, point: Point2) -> usize {
        if let Some(i) = self
            .nodes
            .iter()
            .position(|n| (n - point).norm() <= NODE_SNAP_DISTANCE)
        {
            return i;
        }
        self.nodes.push(point);
        self.nodes.len() - 1
    }

    /// Add a directed edge following `geometry` and return its id.
    pub fn add_edge(&mut self, geometry: Vec<Point2>) -> EdgeId {
        let id = self.edges.keys().next_back().map_or(0, |last| last + 1);
        let edge = Arc::new(RoadEdge::new(id, geometry));
        let from = self.node_for(edge.start());
        let to = self.node_for(edge.end());
        self.edge_nodes.insert(id, (from, to));
        self.outgoing.entry(from).or_default().push(id);
        self.edges.insert(id, edge);
        id
    }

    /// Add an edge in each direction along `geometry`.
    pub fn add_two_way(&mut self, geometry: Vec<Point2>) -> (EdgeId, EdgeId) {
        let reversed: Vec<Point2> = geometry.iter().rev().cloned().collect();
        (self.add_edge(geometry), self.add_edge(reversed))
    }

    /// Edges leaving the end of `id`, excluding its own reverse.
    pub fn successors(&self, id: EdgeId) -> Vec<Arc<RoadEdge>> {
        let Some(&(from, to)) = self.edge_nodes.get(&id) else {
            return Vec::new();
        };
        self.outgoing
            .get(&to)
            .into_iter()
            .flatten()
            .filter(|next| self.edge_nodes.get(next).is_some_and(|&(_, end)| end != from))
            .filter_map(|next| self.edges.get(next).cloned())
            .collect()
    }

    /// Depth-first search from `start` for chains ending on a destination edge.
    fn search_from(
        &self,
        start: &Arc<RoadEdge>,
        remaining_on_start: f64,
        destinations: &HashSet<EdgeId>,
        search: &PathSearchParameters,
        found: &mut BTreeSet<Path>,
    ) {
        let mut stack: Vec<(Vec<Arc<RoadEdge>>, f64)> = vec![(vec![start.clone()], remaining_on_start)];
        while let Some((chain, travelled)) = stack.pop() {
            let last = &chain[chain.len() - 1];
            if destinations.contains(&last.id()) {
                found.insert(Path::from_road_edges(&chain, false));
            }
            if chain.len() >= search.max_edges || travelled > search.max_distance {
                continue;
            }
            for next in self.successors(last.id()) {
                if chain.iter().any(|e| e.id() == next.id()) {
                    continue;
                }
                let mut extended = chain.clone();
                let length = next.length();
                extended.push(next);
                stack.push((extended, travelled + length));
            }
        }
    }
}
impl RoadNetwork for SimpleRoadGraph {
    fn edge(&self, id: EdgeId) -> Option<Arc<RoadEdge>> {
        self.edges.get(&id).cloned()
    }

    fn nearby_edges(&self, point: &Point2, radius: f64) -> Vec<Arc<RoadEdge>> {
        let mut nearby: Vec<(f64, Arc<RoadEdge>)> = self
            .edges
            .values()
            .map(|e| (e.project(point).1, e.clone()))
            .filter(|(d, _)| *d <= radius)
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id().cmp(&b.1.id())));
        nearby.into_iter().map(|(_, e)| e).collect()
    }

    fn paths(
        &self,
        belief: &PathStateDistribution,
        observation: &Observation,
        search: &PathSearchParameters,
    ) -> Vec<Path> {
        let destinations: HashSet<EdgeId> = self
            .nearby_edges(&observation.projected, search.nearby_radius)
            .iter()
            .map(|e| e.id())
            .collect();
        let starts: Vec<(Arc<RoadEdge>, f64)> = match belief.edge().road_edge() {
            Some(edge) => {
                let offset = belief.edge().offset_of(belief.mean().state()[0]);
                vec![(edge.clone(), (edge.length() - offset).max(0.0))]
            }
            None => {
                let position = belief.mean().ground_position();
                self.nearby_edges(&position, search.nearby_radius)
                    .into_iter()
                    .map(|e| {
                        let offset = self.length_along_edge(&e, &position);
                        let remaining = e.length() - offset;
                        (e, remaining)
                    })
                    .collect()
            }
        };
        let mut found = BTreeSet::new();
        if !destinations.is_empty() {
            for (start, remaining) in &starts {
                self.search_from(start, *remaining, &destinations, search, &mut found);
            }
        }
        trace!(
            "path search from {} start edges to {} destinations found {} road paths",
            starts.len(),
            destinations.len(),
            found.len()
        );
        let mut paths = Vec::with_capacity(found.len() + 1);
        paths.push(Path::null());
        paths.extend(found);
        paths
    }
}
