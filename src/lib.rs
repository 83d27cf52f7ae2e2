//! Capture packets per device, replay them with a resumable per-file
//! cursor, and aggregate traffic per flow and time window.

pub mod aggregate;
pub mod capture;
pub mod cursor;
pub mod id;
pub mod models;
pub mod pipeline;
pub mod upload;
pub mod utils;
