//! SRT publishing.

mod connector;
mod session;
mod socket;
mod stats;
mod uri;

pub use connector::TokioSrtConnector;
pub use session::SrtSession;
pub use socket::{SocketStatus, SrtConnector, SrtSocket, WriteSignal};
pub use stats::{SrtStats, SrtStatsSampler};
pub use uri::{SrtMode, SrtTarget, MIN_SRT_PORT};
