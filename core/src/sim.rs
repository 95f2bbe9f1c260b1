//! File formats, run configuration and simulation around the tracking filter.
//!
//! This module provides:
//! - `ObservationRecord` for reading and writing GPS fixes as CSV
//! - `EstimateRecord` for the per-step filter output
//! - `RoadNetworkFile`, a JSON description of a road network loaded into a [`SimpleRoadGraph`]
//! - `RunConfig`, loaded from TOML or JSON
//! - `simulate_drive` for generating noisy fixes along a known path
//! - `run_filter` and `run` for driving a filter over a sequence of observations
use crate::filter::{FilterConfig, VehicleTrackingFilter};
use crate::graph::{RoadNetwork, SimpleRoadGraph};
use crate::path::Path as RoadPath;
use crate::{GeoCoordinate, LocalProjection, Observation, Point2, Result, TrackingError};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use nalgebra::DVector;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One GPS fix as stored in a CSV file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// RFC 3339 timestamp
    pub time: String,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}
impl ObservationRecord {
    /// Reads a CSV file of fixes.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use roadtrack::sim::ObservationRecord;
    ///
    /// let records = ObservationRecord::from_csv("./data/drive.csv").unwrap();
    /// println!("Loaded {} fixes", records.len());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_observation(observation: &Observation) -> Self {
        ObservationRecord {
            time: observation.time.to_rfc3339(),
            latitude: observation.coordinate.latitude,
            longitude: observation.coordinate.longitude,
        }
    }
    pub fn to_observation(&self, projection: &LocalProjection) -> Result<Observation> {
        let time = DateTime::parse_from_rfc3339(&self.time)
            .map_err(|e| TrackingError::Serialization(format!("bad time '{}': {}", self.time, e)))?
            .with_timezone(&Utc);
        Observation::new(
            time,
            GeoCoordinate::new(self.latitude, self.longitude),
            projection,
        )
    }
}

/// Filter output for one observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub time: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Local east coordinate, m
    pub x: f64,
    /// Local north coordinate, m
    pub y: f64,
    /// m/s
    pub speed: f64,
    /// Road edge of the estimate, empty off road
    pub edge: Option<u64>,
    pub on_road_fraction: f64,
    pub effective_sample_size: f64,
    pub distinct_particles: usize,
}
impl EstimateRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// A road in a network file: a polyline of `[latitude, longitude]` pairs in travel order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadRecord {
    pub geometry: Vec<[f64; 2]>,
    #[serde(default)]
    pub two_way: bool,
}

/// JSON road network description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadNetworkFile {
    pub roads: Vec<RoadRecord>,
}
impl RoadNetworkFile {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
    /// Project every road onto the local plane and build the graph.
    pub fn build(&self, projection: &LocalProjection) -> Result<SimpleRoadGraph> {
        let mut graph = SimpleRoadGraph::new();
        for (i, road) in self.roads.iter().enumerate() {
            let geometry = road
                .geometry
                .iter()
                .map(|[lat, lon]| projection.project(&GeoCoordinate::new(*lat, *lon)))
                .collect::<Result<Vec<Point2>>>()?;
            let length: f64 = geometry.windows(2).map(|w| (w[1] - w[0]).norm()).sum();
            if geometry.len() < 2 || length <= 0.0 {
                return Err(TrackingError::InvalidConfig(format!(
                    "road {} needs at least two distinct points",
                    i
                )));
            }
            if road.two_way {
                graph.add_two_way(geometry);
            } else {
                graph.add_edge(geometry);
            }
        }
        Ok(graph)
    }
}

/// Everything needed for a batch run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// CSV of [`ObservationRecord`]s
    pub input: PathBuf,
    /// Where the [`EstimateRecord`]s are written
    pub output: PathBuf,
    /// JSON [`RoadNetworkFile`]
    pub network: PathBuf,
    /// Origin of the local plane; the first fix when absent
    #[serde(default)]
    pub origin: Option<GeoCoordinate>,
    #[serde(default)]
    pub filter: FilterConfig,
}
impl RunConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&text)?),
            Some("json") => Ok(serde_json::from_str(&text)?),
            other => Err(TrackingError::InvalidConfig(format!(
                "unsupported configuration format {:?}",
                other.unwrap_or("")
            ))),
        }
    }
}

/// A simulated fix and the position it was generated from.
#[derive(Clone, Debug)]
pub struct SimulatedFix {
    pub observation: Observation,
    pub truth: Point2,
}

/// Drive along `path` at constant `speed` from its start, emitting a fix every `interval`
/// seconds with isotropic Gaussian noise of standard deviation `noise`. The vehicle stops
/// at the end of the path.
#[allow(clippy::too_many_arguments)]
pub fn simulate_drive<R: Rng + ?Sized>(
    path: &RoadPath,
    speed: f64,
    interval: f64,
    count: usize,
    noise: f64,
    start: DateTime<Utc>,
    projection: &LocalProjection,
    rng: &mut R,
) -> Result<Vec<SimulatedFix>> {
    if path.is_null() {
        return Err(TrackingError::InvalidConfig(
            "cannot drive along the null path".to_string(),
        ));
    }
    let normal = Normal::new(0.0, noise)
        .map_err(|e| TrackingError::InvalidConfig(format!("noise: {}", e)))?;
    let mut fixes = Vec::with_capacity(count);
    for i in 0..count {
        let elapsed = interval * i as f64;
        let distance = path.clamp_distance(path.direction() * speed * elapsed);
        let ground = path.road_to_ground(&DVector::from_vec(vec![distance, 0.0]));
        let truth = Point2::new(ground[0], ground[2]);
        let noisy = truth + Point2::new(normal.sample(rng), normal.sample(rng));
        let time = start + Duration::microseconds((elapsed * 1e6).round() as i64);
        fixes.push(SimulatedFix {
            observation: Observation::from_projected(time, noisy, projection),
            truth,
        });
    }
    Ok(fixes)
}

/// Run `filter` over `observations`, one estimate per observation. Estimates are mapped back
/// to latitude and longitude with `projection`.
///
/// A degenerate population is logged and the filter is reinitialized at that observation.
pub fn run_filter<G: RoadNetwork>(
    filter: &mut VehicleTrackingFilter<G>,
    observations: &[Observation],
    projection: &LocalProjection,
) -> Result<Vec<EstimateRecord>> {
    let mut records = Vec::with_capacity(observations.len());
    for observation in observations {
        let summary = match filter.update(observation) {
            Ok(summary) => summary,
            Err(TrackingError::DegeneratePopulation(n)) => {
                warn!(
                    "all {} particles lost at {}; reinitializing",
                    n,
                    observation.time.to_rfc3339()
                );
                filter.reset();
                filter.update(observation)?
            }
            Err(err) => return Err(err),
        };
        let Some(estimate) = filter.estimate() else {
            continue;
        };
        let position = estimate.ground_position();
        let ground = estimate.ground_state();
        let coordinate = projection.unproject(&position);
        records.push(EstimateRecord {
            time: observation.time.to_rfc3339(),
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            x: position.x,
            y: position.y,
            speed: ground[1].hypot(ground[3]),
            edge: estimate.edge().edge().id(),
            on_road_fraction: summary.on_road_fraction,
            effective_sample_size: summary.effective_sample_size,
            distinct_particles: summary.distinct_particles,
        });
    }
    Ok(records)
}

/// Load the files named in `config`, run the filter and write the estimates. Returns the
/// number of estimates written.
pub fn run(config: &RunConfig) -> Result<usize> {
    let records = ObservationRecord::from_csv(&config.input)?;
    let origin = match (config.origin, records.first()) {
        (Some(origin), _) => origin,
        (None, Some(first)) => GeoCoordinate::new(first.latitude, first.longitude),
        (None, None) => {
            EstimateRecord::to_csv(&[], &config.output)?;
            return Ok(0);
        }
    };
    let projection = LocalProjection::new(origin);
    let observations = records
        .iter()
        .map(|r| r.to_observation(&projection))
        .collect::<Result<Vec<_>>>()?;
    let graph = RoadNetworkFile::from_json(&config.network)?.build(&projection)?;
    info!(
        "loaded {} fixes and {} road edges around {}",
        observations.len(),
        graph.len(),
        origin
    );
    let mut filter = VehicleTrackingFilter::new(config.filter.clone(), Arc::new(graph))?;
    let estimates = run_filter(&mut filter, &observations, &projection)?;
    EstimateRecord::to_csv(&estimates, &config.output)?;
    info!(
        "wrote {} estimates to {}",
        estimates.len(),
        config.output.display()
    );
    Ok(estimates.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SimpleRoadGraph;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn origin() -> GeoCoordinate {
        GeoCoordinate::new(39.95, -75.16)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_observation_record_csv() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("fixes.csv");
        let projection = LocalProjection::new(origin());
        let observation =
            Observation::from_projected(start(), Point2::new(120.0, -40.0), &projection);
        let records = vec![ObservationRecord::from_observation(&observation)];
        ObservationRecord::to_csv(&records, &file).unwrap();
        let read = ObservationRecord::from_csv(&file).unwrap();
        assert_eq!(read, records);
        let back = read[0].to_observation(&projection).unwrap();
        assert_eq!(back.time, start());
        assert!((back.projected - observation.projected).norm() < 1e-6);
    }

    #[test]
    fn test_observation_record_errors() {
        assert!(ObservationRecord::from_csv("./does/not/exist.csv").is_err());
        let record = ObservationRecord {
            time: "yesterday".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        };
        let projection = LocalProjection::new(origin());
        assert!(matches!(
            record.to_observation(&projection),
            Err(TrackingError::Serialization(_))
        ));
        let record = ObservationRecord {
            time: start().to_rfc3339(),
            latitude: -20.0,
            longitude: 60.0,
        };
        assert!(matches!(
            record.to_observation(&projection),
            Err(TrackingError::Projection { .. })
        ));
    }

    #[test]
    fn test_run_config_formats() {
        let dir = tempdir().unwrap();
        let toml_file = dir.path().join("run.toml");
        fs::write(
            &toml_file,
            "input = \"fixes.csv\"\noutput = \"out.csv\"\nnetwork = \"roads.json\"\n\n[filter]\nparticles = 25\nresampling = \"residual\"\n",
        )
        .unwrap();
        let config = RunConfig::from_file(&toml_file).unwrap();
        assert_eq!(config.filter.particles, 25);
        assert_eq!(
            config.filter.resampling,
            crate::particle::ParticleResamplingStrategy::Residual
        );
        assert_eq!(config.filter.seed, FilterConfig::default().seed);
        assert!(config.origin.is_none());

        let json_file = dir.path().join("run.json");
        fs::write(&json_file, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(RunConfig::from_file(&json_file).unwrap(), config);

        let yaml_file = dir.path().join("run.yaml");
        fs::write(&yaml_file, "input: x").unwrap();
        assert!(matches!(
            RunConfig::from_file(&yaml_file),
            Err(TrackingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_simulate_drive() {
        let mut graph = SimpleRoadGraph::new();
        graph.add_edge(vec![Point2::new(0.0, 0.0), Point2::new(100.0, 0.0)]);
        let edge = graph.edges().next().unwrap().clone();
        let path = RoadPath::from_road_edges(&[edge], false);
        let projection = LocalProjection::new(origin());
        let mut rng = StdRng::seed_from_u64(3);
        let fixes =
            simulate_drive(&path, 10.0, 1.0, 15, 0.0, start(), &projection, &mut rng).unwrap();
        assert_eq!(fixes.len(), 15);
        assert!((fixes[3].truth - Point2::new(30.0, 0.0)).norm() < 1e-9);
        assert!((fixes[14].truth - Point2::new(100.0, 0.0)).norm() < 1e-9);
        assert_eq!(fixes[2].observation.time, start() + Duration::seconds(2));
        assert!(
            simulate_drive(&RoadPath::null(), 1.0, 1.0, 1, 1.0, start(), &projection, &mut rng)
                .is_err()
        );
    }

    #[test]
    fn test_run_end_to_end() {
        let dir = tempdir().unwrap();
        let projection = LocalProjection::new(origin());
        let west = projection.unproject(&Point2::new(0.0, 0.0));
        let east = projection.unproject(&Point2::new(600.0, 0.0));
        let network = RoadNetworkFile {
            roads: vec![RoadRecord {
                geometry: vec![
                    [west.latitude, west.longitude],
                    [east.latitude, east.longitude],
                ],
                two_way: true,
            }],
        };
        let network_file = dir.path().join("roads.json");
        network.to_json(&network_file).unwrap();

        let graph = network.build(&projection).unwrap();
        assert_eq!(graph.len(), 2);
        let edge = graph.edges().next().unwrap().clone();
        let path = RoadPath::from_road_edges(&[edge], false);
        let mut rng = StdRng::seed_from_u64(11);
        let fixes =
            simulate_drive(&path, 12.0, 1.0, 12, 3.0, start(), &projection, &mut rng).unwrap();
        let records: Vec<ObservationRecord> = fixes
            .iter()
            .map(|f| ObservationRecord::from_observation(&f.observation))
            .collect();
        let input = dir.path().join("fixes.csv");
        ObservationRecord::to_csv(&records, &input).unwrap();

        let config = RunConfig {
            input,
            output: dir.path().join("estimates.csv"),
            network: network_file,
            origin: Some(origin()),
            filter: FilterConfig {
                particles: 40,
                ..FilterConfig::default()
            },
        };
        assert_eq!(run(&config).unwrap(), 12);
        let estimates = EstimateRecord::from_csv(&config.output).unwrap();
        assert_eq!(estimates.len(), 12);
        let last = &estimates[11];
        let truth = fixes[11].truth;
        assert!((Point2::new(last.x, last.y) - truth).norm() < 20.0);
        assert!(estimates.iter().all(|e| e.distinct_particles >= 1));
    }
}
