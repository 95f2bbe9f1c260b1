//! End-to-end tests of the road-constrained tracking filter
//!
//! The drives are simulated along a small L-shaped network (800 m east, then 600 m north,
//! both roads two-way) with isotropic GPS noise. The error bounds in the assertions are
//! regression checks derived from running the filter on these drives, not design goals.
//!
//! ## Error Metrics
//!
//! - **Horizontal position error**: Haversine distance between the estimate and the true
//!   position the fix was generated from (meters)
use std::sync::Arc;

use roadtrack::earth::haversine_distance;
use roadtrack::filter::{FilterConfig, VehicleTrackingFilter};
use roadtrack::graph::{RoadNetwork, SimpleRoadGraph};
use roadtrack::mixture::PathStateMixture;
use roadtrack::particle::{ParticleResamplingStrategy, counts_from_indices};
use roadtrack::path::{InferredEdge, Path, PathEdge, RoadEdge};
use roadtrack::sim::{EstimateRecord, SimulatedFix, run_filter, simulate_drive};
use roadtrack::state::{PathState, PathStateDistribution};
use roadtrack::transition::EdgeTransitionEstimator;
use roadtrack::{GeoCoordinate, LocalProjection, Point2, TrackingError};

use assert_approx_eq::assert_approx_eq;
use chrono::{TimeZone, Utc};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn projection() -> LocalProjection {
    LocalProjection::new(GeoCoordinate::new(40.4406, -79.9959))
}

/// Two-way L-shaped network and the forward path around its corner.
fn l_network() -> (Arc<SimpleRoadGraph>, Path) {
    let mut graph = SimpleRoadGraph::new();
    let (east, _) = graph.add_two_way(vec![Point2::new(0.0, 0.0), Point2::new(800.0, 0.0)]);
    let (north, _) = graph.add_two_way(vec![Point2::new(800.0, 0.0), Point2::new(800.0, 600.0)]);
    let path = Path::from_road_edges(
        &[graph.edge(east).unwrap(), graph.edge(north).unwrap()],
        false,
    );
    (Arc::new(graph), path)
}

fn drive(path: &Path, count: usize, noise: f64, seed: u64) -> Vec<SimulatedFix> {
    let start = Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    simulate_drive(path, 12.0, 1.0, count, noise, start, &projection(), &mut rng).unwrap()
}

fn track(config: FilterConfig, fixes: &[SimulatedFix]) -> Vec<EstimateRecord> {
    let (graph, _) = l_network();
    let mut filter = VehicleTrackingFilter::new(config, graph).unwrap();
    let observations: Vec<_> = fixes.iter().map(|f| f.observation.clone()).collect();
    run_filter(&mut filter, &observations, &projection()).unwrap()
}

fn horizontal_errors(estimates: &[EstimateRecord], fixes: &[SimulatedFix]) -> Vec<f64> {
    estimates
        .iter()
        .zip(fixes)
        .map(|(estimate, fix)| {
            let truth = projection().unproject(&fix.truth);
            haversine_distance(
                estimate.latitude,
                estimate.longitude,
                truth.latitude,
                truth.longitude,
            )
        })
        .collect()
}

fn straight_edge(id: u64, length: f64) -> Arc<RoadEdge> {
    Arc::new(RoadEdge::new(
        id,
        vec![Point2::new(0.0, 0.0), Point2::new(length, 0.0)],
    ))
}

#[test]
fn test_tracks_around_corner() {
    let (_, path) = l_network();
    let fixes = drive(&path, 90, 4.0, 5);
    let config = FilterConfig {
        particles: 60,
        seed: 2024,
        ..FilterConfig::default()
    };
    let estimates = track(config, &fixes);
    assert_eq!(estimates.len(), fixes.len());
    let errors = horizontal_errors(&estimates, &fixes);
    let mean = errors.iter().sum::<f64>() / errors.len() as f64;
    let settled = &errors[10..];
    let max_settled = settled.iter().cloned().fold(0.0, f64::max);
    assert!(mean < 12.0, "mean horizontal error {:.2} m", mean);
    assert!(max_settled < 40.0, "max horizontal error {:.2} m", max_settled);
    // past the corner the estimate is on the northbound road or close to it
    let last = &estimates[estimates.len() - 1];
    assert!(last.y > 200.0, "final estimate {:?}", last);
}

#[test]
fn test_every_strategy_keeps_population_size() {
    let (graph, path) = l_network();
    let fixes = drive(&path, 20, 4.0, 9);
    for strategy in [
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Residual,
    ] {
        let config = FilterConfig {
            particles: 30,
            resampling: strategy,
            ..FilterConfig::default()
        };
        let mut filter = VehicleTrackingFilter::new(config, graph.clone()).unwrap();
        for fix in &fixes {
            filter.update(&fix.observation).unwrap();
            assert_eq!(filter.population().total(), 30, "{:?}", strategy);
        }
    }
}

#[test]
fn test_same_seed_reproduces_run() {
    let (_, path) = l_network();
    let fixes = drive(&path, 25, 4.0, 3);
    let config = FilterConfig {
        particles: 40,
        seed: 99,
        ..FilterConfig::default()
    };
    let first = track(config.clone(), &fixes);
    let second = track(config, &fixes);
    assert_eq!(first, second);
}

#[test]
fn test_parallel_scoring_matches_sequential() {
    let (_, path) = l_network();
    let fixes = drive(&path, 15, 4.0, 4);
    let sequential = FilterConfig {
        particles: 40,
        ..FilterConfig::default()
    };
    let parallel = FilterConfig {
        parallel: true,
        ..sequential.clone()
    };
    assert_eq!(track(sequential, &fixes), track(parallel, &fixes));
}

#[test]
fn test_lineage_links_back_through_generations() {
    let (graph, path) = l_network();
    let fixes = drive(&path, 12, 4.0, 8);
    let config = FilterConfig {
        particles: 20,
        lineage_depth: 4,
        ..FilterConfig::default()
    };
    let mut filter = VehicleTrackingFilter::new(config, graph).unwrap();
    for fix in &fixes {
        filter.update(&fix.observation).unwrap();
    }
    for id in filter.population().ids() {
        let ancestry = filter.lineage().ancestry(id);
        assert_eq!(ancestry.len(), 5);
        for pair in ancestry.windows(2) {
            assert_eq!(pair[0].parent, Some(pair[1].id));
            assert_eq!(pair[0].generation, pair[1].generation + 1);
            assert!(pair[0].time > pair[1].time);
        }
    }
}

#[test]
fn test_resampling_negligible_weight() {
    let mut rng = StdRng::seed_from_u64(1234);
    let indices = ParticleResamplingStrategy::default()
        .resample(&[-1.0, -1.0, -100.0], 1000, &mut rng)
        .unwrap();
    let counts = counts_from_indices(&indices, 3);
    assert_eq!(counts.iter().sum::<usize>(), 1000);
    assert!((counts[2] as f64) / 1000.0 < 0.01);
}

#[test]
fn test_degenerate_population_fails() {
    let mut rng = StdRng::seed_from_u64(0);
    let result = ParticleResamplingStrategy::Systematic.resample(
        &[f64::NEG_INFINITY, f64::NEG_INFINITY],
        10,
        &mut rng,
    );
    assert!(matches!(result, Err(TrackingError::DegeneratePopulation(2))));
}

#[test]
fn test_transition_posterior_closed_form() {
    let road = InferredEdge::from(straight_edge(1, 10.0));
    let free = InferredEdge::Free;
    let empty = EdgeTransitionEstimator::default();
    assert_approx_eq!(empty.evaluate(&free, &free), 0.5, 1e-12);
    assert_approx_eq!(empty.evaluate(&free, &road), 0.5, 1e-12);

    let once = empty.update(&free, &road);
    assert!(once.evaluate(&free, &road) > once.evaluate(&free, &free));
    assert_approx_eq!(once.evaluate(&free, &road), 2.0 / 3.0, 1e-12);

    let a = once.update(&free, &free);
    let b = empty.update(&free, &free).update(&free, &road);
    assert_eq!(a, b);
    assert_approx_eq!(a.free_motion_probabilities()[0], 2.0 / 4.0, 1e-12);
    // the on-road model is untouched by off-road transitions
    assert_eq!(a.edge_motion_prior(), &[1.0, 1.0]);

    let c = a.update(&road, &free).update(&road, &road).update(&road, &road);
    assert_approx_eq!(c.edge_motion_probabilities()[0], 3.0 / 5.0, 1e-12);
    assert_approx_eq!(c.edge_motion_probabilities()[1], 2.0 / 5.0, 1e-12);
    // with sampled Multinomial parameters the point estimate and the predictive part ways
    let sampled = c.sample_prior_parameters(&mut StdRng::seed_from_u64(5));
    assert_eq!(sampled.edge_motion_prior(), c.edge_motion_prior());
    assert_approx_eq!(
        sampled.predictive_log_likelihood(&road, &free),
        (2.0_f64 / 5.0).ln(),
        1e-12
    );
    assert_ne!(
        sampled.log_evaluate(Some(&road), &free),
        sampled.predictive_log_likelihood(&road, &free)
    );
}

#[test]
fn test_checked_state_boundary_law() {
    let edge = PathEdge::new(straight_edge(3, 50.0), 20.0, false);
    let tolerance = 0.5;
    let inside = DVector::from_vec(vec![20.0 + 50.0 + 0.4, 3.0]);
    let clamped = edge.checked_state_on_edge(&inside, tolerance, false).unwrap();
    assert_approx_eq!(clamped[0], 70.0, 1e-12);
    assert_approx_eq!(clamped[1], 3.0, 1e-12);
    let relative = edge.checked_state_on_edge(&inside, tolerance, true).unwrap();
    assert_approx_eq!(relative[0], 50.0, 1e-12);
    let outside = DVector::from_vec(vec![20.0 + 50.0 + 0.6, 3.0]);
    assert!(edge.checked_state_on_edge(&outside, tolerance, false).is_none());
    let before = DVector::from_vec(vec![19.0, 3.0]);
    assert!(edge.checked_state_on_edge(&before, tolerance, false).is_none());
    assert!(edge.contains_distance(20.0) && edge.contains_distance(70.0));
    assert!(!edge.contains_distance(70.001));
}

#[test]
fn test_ground_road_round_trip() {
    let (_, path) = l_network();
    for ground in [
        DVector::from_vec(vec![250.0, 11.0, 0.0, 0.0]),
        DVector::from_vec(vec![800.0, 0.0, 420.0, 7.5]),
    ] {
        let state = PathState::from_ground(path.clone(), &ground);
        assert!(state.is_on_road());
        let back = state.ground_state();
        for i in 0..4 {
            assert_approx_eq!(back[i], ground[i], 1e-9);
        }
    }
}

#[test]
fn test_mixture_mean_on_shared_edge() {
    let path = Path::from_road_edges(&[straight_edge(1, 100.0)], false);
    let belief = |s: f64, v: f64| {
        PathStateDistribution::new(
            PathState::new(path.clone(), DVector::from_vec(vec![s, v])),
            DMatrix::identity(2, 2),
        )
    };
    let mixture = PathStateMixture::new(
        vec![belief(40.0, 10.0), belief(60.0, 14.0)],
        vec![0.9_f64.ln(), 0.1_f64.ln()],
    );
    assert_approx_eq!(mixture.log_prior_weight_sum(), 0.0, 1e-12);
    let mean = mixture.mean().unwrap();
    assert_eq!(mean.path(), &path);
    assert_approx_eq!(mean.state()[0], 42.0, 1e-12);
    assert_approx_eq!(mean.state()[1], 10.4, 1e-12);
}

#[test]
fn test_candidate_paths_turn_the_corner() {
    let (graph, path) = l_network();
    let fixes = drive(&path, 70, 0.0, 1);
    let edge = path.first_edge().clone();
    let belief = PathStateDistribution::new(
        PathState::new(
            Path::new(vec![edge], false),
            DVector::from_vec(vec![780.0, 12.0]),
        ),
        DMatrix::identity(2, 2),
    );
    let candidates = graph.paths(&belief, &fixes[68].observation, &FilterConfig::default().search);
    assert!(candidates.contains(&Path::null()));
    assert!(candidates.iter().any(|p| p == &path));
}
