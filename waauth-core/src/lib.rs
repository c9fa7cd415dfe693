pub mod machine;
pub mod session;
pub mod timer;
pub mod wire;

use thiserror::Error;

pub use machine::{AuthMachine, EXHAUSTED_RETRY_MESSAGE, Effect, Event, SessionCommand};
pub use session::{ConnectionPhase, SessionState};
pub use timer::{
    ArmedTimers, MAX_RECONNECT_ATTEMPTS, REDIRECT_DELAY_MS, TimerKind, TimerMode, Timings,
    reconnect_delay,
};
pub use wire::{
    ClientReady, InboundMessage, InitialState, OutboundKind, OutboundMessage, QrUpdated,
    decode_inbound, encode_outbound,
};

pub const QR_PATH: &str = "/api/wa/qr";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unrecognized message type {0:?}")]
    UnrecognizedType(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
