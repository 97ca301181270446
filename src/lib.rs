pub mod cluster;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod recovery;
pub mod rng;
pub mod scheduler;
pub mod shutdown;
pub mod snapshot;
pub mod state;
pub mod stats;
pub mod worker;

pub use cluster::Cluster;
pub use config::SimConfig;
pub use error::{Result, SimError};
