pub mod aggregator;
pub mod model;
pub mod pipeline;

pub use aggregator::OffsetAggregator;
