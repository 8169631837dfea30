pub mod importer;
pub mod point;
pub mod stats;
pub mod store;

pub use importer::{BatchSettings, Importer, RunningImporter};
pub use store::InfluxClient;
