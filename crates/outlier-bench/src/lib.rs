//! Benchmark suite for the outlier detectors
//!
//! Each scenario trains one detector on synthetic Gaussian clusters and
//! scores a held-out mix of cluster points and scattered anomalies:
//! - Precision, Recall, F1-Score and accuracy against ground truth
//! - Detection latency (p50, p95, p99)
//! - Throughput (detections per second)

use std::time::{Duration, Instant};

use outlier_core::{
    ConfusionMatrix, DbscanConfig, Detector, DetectorSettings, IsolationForestConfig,
    LabeledPoint, LofConfig, train_test_split,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Rejection-sampling draws allowed per requested anomaly
const ATTEMPTS_PER_ANOMALY: usize = 10_000;

/// Shape of the synthetic data set
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DatasetConfig {
    /// Cluster centres; every cluster shares `std_dev`
    pub centers: Vec<Vec<f64>>,
    pub std_dev: f64,
    pub points_per_cluster: usize,
    /// Anomalies scattered uniformly in `[-extent, extent]` per axis
    pub anomalies: usize,
    pub extent: f64,
    /// Minimum distance between an anomaly and every centre
    pub min_anomaly_distance: f64,
    /// Share of cluster points held out for testing
    pub test_ratio: f64,
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            centers: vec![vec![0.0, 0.0], vec![12.0, 12.0], vec![-10.0, 9.0]],
            std_dev: 1.0,
            points_per_cluster: 300,
            anomalies: 30,
            extent: 30.0,
            min_anomaly_distance: 6.0,
            test_ratio: 0.2,
            seed: 42,
        }
    }
}

/// Training points plus labelled test points
#[derive(Clone, Debug)]
pub struct Dataset {
    pub train: Vec<Vec<f64>>,
    pub test: Vec<LabeledPoint>,
}

impl Dataset {
    pub fn generate(config: &DatasetConfig) -> outlier_core::Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let noise = Normal::new(0.0, config.std_dev).map_err(|e| {
            outlier_core::AnomalyError::InvalidParameter {
                name: "std_dev",
                reason: e.to_string(),
            }
        })?;

        let mut normal = Vec::with_capacity(config.centers.len() * config.points_per_cluster);
        for center in &config.centers {
            for _ in 0..config.points_per_cluster {
                normal.push(
                    center
                        .iter()
                        .map(|c| c + noise.sample(&mut rng))
                        .collect::<Vec<f64>>(),
                );
            }
        }

        let (train, held_out) = train_test_split(&normal, config.test_ratio, config.seed)?;
        let mut test: Vec<LabeledPoint> = held_out.into_iter().map(LabeledPoint::normal).collect();

        let dims = config.centers.first().map_or(2, Vec::len);
        let max_attempts = config.anomalies.saturating_mul(ATTEMPTS_PER_ANOMALY);
        let mut found = 0;
        let mut attempts = 0;
        while found < config.anomalies {
            if attempts == max_attempts {
                return Err(outlier_core::AnomalyError::InvalidParameter {
                    name: "min_anomaly_distance",
                    reason: format!(
                        "placed {found} of {} anomalies in {attempts} draws; \
                         no room at distance {} within extent {}",
                        config.anomalies, config.min_anomaly_distance, config.extent
                    ),
                });
            }
            attempts += 1;

            let candidate: Vec<f64> = (0..dims)
                .map(|_| rng.random_range(-config.extent..=config.extent))
                .collect();
            let clear_of_clusters = config.centers.iter().all(|c| {
                outlier_core::euclidean(c, &candidate)
                    .is_ok_and(|d| d >= config.min_anomaly_distance)
            });
            if clear_of_clusters {
                test.push(LabeledPoint::anomaly(candidate));
                found += 1;
            }
        }

        debug!(
            train = train.len(),
            test = test.len(),
            anomalies = config.anomalies,
            "Dataset generated"
        );
        Ok(Self { train, test })
    }
}

/// Benchmark configuration
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BenchmarkConfig {
    pub name: String,
    pub detector: DetectorSettings,
    pub dataset: DatasetConfig,
}

/// Benchmark results with ground-truth metrics
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BenchmarkResults {
    pub config: String,
    pub detector: String,
    pub training_points: usize,
    pub test_points: usize,
    pub train_millis: f64,

    pub confusion: ConfusionMatrix,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub accuracy: f64,

    pub latency_micros: LatencyMetrics,
    pub throughput_dps: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LatencyMetrics {
    pub p50_micros: f64,
    pub p95_micros: f64,
    pub p99_micros: f64,
    pub avg_micros: f64,
}

impl LatencyMetrics {
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let len = sorted.len();
        Self {
            p50_micros: sorted[len / 2] as f64,
            p95_micros: sorted[len * 95 / 100] as f64,
            p99_micros: sorted[len * 99 / 100] as f64,
            avg_micros: sorted.iter().sum::<u64>() as f64 / len as f64,
        }
    }
}

/// Trains and evaluates one detector per run
#[derive(Default)]
pub struct BenchmarkRunner {
    latencies: Vec<u64>,
}

impl BenchmarkRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&mut self, config: &BenchmarkConfig) -> outlier_core::Result<BenchmarkResults> {
        self.latencies.clear();
        let dataset = Dataset::generate(&config.dataset)?;
        let mut detector = config.detector.clone().build()?;

        info!(
            config = %config.name,
            detector = detector.name(),
            train = dataset.train.len(),
            "Running benchmark"
        );

        let train_start = Instant::now();
        for point in &dataset.train {
            detector.add_training_data(point)?;
        }
        detector.train()?;
        let train_elapsed = train_start.elapsed();

        let mut confusion = ConfusionMatrix::default();
        let detect_start = Instant::now();
        for sample in &dataset.test {
            let start = Instant::now();
            let result = detector.detect_multi(&sample.features)?;
            self.latencies.push(start.elapsed().as_micros() as u64);
            confusion.record(sample.is_anomaly, result.is_anomaly);
        }
        let detect_elapsed = detect_start.elapsed();

        Ok(BenchmarkResults {
            config: config.name.clone(),
            detector: detector.name().to_string(),
            training_points: dataset.train.len(),
            test_points: dataset.test.len(),
            train_millis: train_elapsed.as_secs_f64() * 1000.0,
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1_score: confusion.f1_score(),
            accuracy: confusion.accuracy(),
            confusion,
            latency_micros: LatencyMetrics::from_samples(&self.latencies),
            throughput_dps: per_second(dataset.test.len(), detect_elapsed),
        })
    }

    pub fn print_results(&self, results: &BenchmarkResults) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║ {:60} ║", results.config);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Detector:           {:>10}                               ║", results.detector);
        println!(
            "║ Train / Test:       {:>6} / {:<6}                          ║",
            results.training_points, results.test_points
        );
        println!("║ Train Time:         {:>10.1} ms                            ║", results.train_millis);
        println!("╠──────────────────────────────────────────────────────────────╣");
        println!(
            "║ TP {:>5} | FP {:>5} | TN {:>5} | FN {:>5}                   ║",
            results.confusion.true_positives,
            results.confusion.false_positives,
            results.confusion.true_negatives,
            results.confusion.false_negatives
        );
        println!("║ Precision:          {:>10.2}%                              ║", results.precision * 100.0);
        println!("║ Recall:             {:>10.2}%                              ║", results.recall * 100.0);
        println!("║ F1-Score:           {:>10.3}                               ║", results.f1_score);
        println!("╠──────────────────────────────────────────────────────────────╣");
        println!(
            "║ Latency p50/p95/p99: {:>6.0} / {:>6.0} / {:>6.0} µs             ║",
            results.latency_micros.p50_micros,
            results.latency_micros.p95_micros,
            results.latency_micros.p99_micros
        );
        println!("║ Throughput:         {:>10.0} detections/s                  ║", results.throughput_dps);
        println!("╚══════════════════════════════════════════════════════════════╝");
    }
}

/// Raw detect throughput on a trained detector
pub fn measure_throughput(
    detector: &mut dyn Detector,
    probes: &[Vec<f64>],
) -> outlier_core::Result<f64> {
    let start = Instant::now();
    for probe in probes {
        detector.detect_multi(probe)?;
    }
    Ok(per_second(probes.len(), start.elapsed()))
}

fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Predefined benchmark scenarios
pub mod scenarios {
    use super::*;

    pub fn isolation_forest() -> BenchmarkConfig {
        BenchmarkConfig {
            name: "Isolation Forest - Gaussian Clusters".to_string(),
            detector: DetectorSettings::IsolationForest(IsolationForestConfig::default().with_seed(7)),
            dataset: DatasetConfig::default(),
        }
    }

    pub fn dbscan() -> BenchmarkConfig {
        BenchmarkConfig {
            name: "DBSCAN - Gaussian Clusters".to_string(),
            detector: DetectorSettings::Dbscan(
                DbscanConfig::new(1.0, 5).with_auto_recluster(false, 100),
            ),
            dataset: DatasetConfig::default(),
        }
    }

    pub fn lof() -> BenchmarkConfig {
        BenchmarkConfig {
            name: "LOF - Gaussian Clusters".to_string(),
            detector: DetectorSettings::Lof(LofConfig::new(10)),
            dataset: DatasetConfig::default(),
        }
    }

    pub fn all() -> Vec<BenchmarkConfig> {
        vec![isolation_forest(), dbscan(), lof()]
    }
}
