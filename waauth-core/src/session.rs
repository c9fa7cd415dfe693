use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Initializing,
    Connecting,
    Connected,
    CheckingSession,
    QrRequired,
    Authenticated,
    Error,
    Disconnected,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Initializing => "initializing",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::CheckingSession => "checking_session",
            ConnectionPhase::QrRequired => "qr_required",
            ConnectionPhase::Authenticated => "authenticated",
            ConnectionPhase::Error => "error",
            ConnectionPhase::Disconnected => "disconnected",
        }
    }

    /// Phases in which a QR payload may be held.
    pub fn is_qr_phase(self) -> bool {
        matches!(
            self,
            ConnectionPhase::CheckingSession | ConnectionPhase::QrRequired
        )
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative record of the authentication session.
///
/// Only the state machine writes it; observers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub qr_payload: Option<String>,
    pub client_ready: bool,
    pub last_error: Option<String>,
    pub connection_attempts: u32,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a description of every state invariant that currently does not hold.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.phase == ConnectionPhase::Authenticated && !self.client_ready {
            violations.push("authenticated without client_ready".to_owned());
        }
        if self.qr_payload.is_some() && !self.phase.is_qr_phase() {
            violations.push(format!("qr payload held in phase {}", self.phase));
        }
        if self.last_error.is_some() && self.phase != ConnectionPhase::Error {
            violations.push(format!("last_error set in phase {}", self.phase));
        }
        violations
    }
}
