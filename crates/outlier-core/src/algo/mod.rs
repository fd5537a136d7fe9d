pub mod dbscan;
pub mod isolation_forest;
pub mod lof;

// Re-exports for convenience
pub use dbscan::{ClusterLabel, DbscanDetector};
pub use isolation_forest::{IsolationForest, IsolationTree, average_path_length};
pub use lof::{ISOLATED_POINT_Z_SCORE, LofDetector};
