//! Time-windowed flow aggregation.

pub mod aggregator;
pub mod sink;
pub mod window;

pub use aggregator::Aggregator;
pub use sink::{AggregateSink, FlowRow};
pub use window::Windows;
