//! Two-party audio/video sessions negotiated over a broadcast signaling channel.

pub mod config;
pub mod matchmaking;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signal;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use config::Config;
pub use session::{SessionContext, SessionController, SessionSnapshot, SessionStatus};
pub use signal::{MatchId, Participant};
