pub mod devices;
pub mod manager;
pub mod parser;
pub mod rotation;

pub use manager::{CaptureManager, LiveStream};
pub use parser::PacketParser;
pub use rotation::Rotation;
