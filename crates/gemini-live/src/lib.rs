mod client;
pub mod types;

pub use client::config::Config;
pub use client::{AudioRx, Session, connect, connect_with_capacity};

/// PCM sample rate of caller audio sent into the session.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// PCM sample rate of synthesized audio produced by the session.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
