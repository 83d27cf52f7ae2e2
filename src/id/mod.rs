//! Durable record ID generation.

pub mod generator;

pub use generator::IdGenerator;
