//! Adaptive bitrate control.
//!
//! Transports feed [`ThroughputSample`]s into a [`RateDecider`], which turns
//! them into up/down/hold vectors with hysteresis. The RTMP path derives
//! samples from its send queue through a [`TcpThroughputSampler`]; the SRT
//! path gets link estimates from the socket itself. A [`BitrateController`]
//! maps each vector onto the encoder bitrate ladder.

mod controller;
mod decider;
mod sample;
mod tcp;
mod window;

pub use controller::{audio_bitrate_for, BitrateController};
pub use decider::{RateDecider, RateDeciderConfig};
pub use sample::ThroughputSample;
pub use tcp::TcpThroughputSampler;
pub use window::SampleWindow;

/// Ratio by which the estimated bandwidth must exceed the current rate
/// before stepping up, and by which a bandwidth estimate is discounted
/// when jumping down to it.
pub const BITRATE_RATIO: f64 = 1.5;

/// Samples kept per window.
pub const SAMPLE_WINDOW_CAPACITY: usize = 30;
