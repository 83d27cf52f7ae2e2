pub mod config;
pub mod device;
pub mod record;
pub mod stats;
