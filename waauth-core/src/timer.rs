use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const QR_REFRESH_INTERVAL_MS: u64 = 30_000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const SESSION_GRACE_MS: u64 = 3_000;
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const RESTART_SETTLE_MS: u64 = 2_000;
pub const LOGOUT_SETTLE_MS: u64 = 1_000;
pub const DESTROY_SETTLE_MS: u64 = 2_000;
pub const REDIRECT_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    QrRefresh,
    Heartbeat,
    Reconnect,
    SessionGrace,
    CommandSettle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Interval,
    OneShot,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::QrRefresh,
        TimerKind::Heartbeat,
        TimerKind::Reconnect,
        TimerKind::SessionGrace,
        TimerKind::CommandSettle,
    ];

    pub fn mode(self) -> TimerMode {
        match self {
            TimerKind::QrRefresh | TimerKind::Heartbeat => TimerMode::Interval,
            TimerKind::Reconnect | TimerKind::SessionGrace | TimerKind::CommandSettle => {
                TimerMode::OneShot
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::QrRefresh => "qr_refresh",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::Reconnect => "reconnect",
            TimerKind::SessionGrace => "session_grace",
            TimerKind::CommandSettle => "command_settle",
        }
    }

    /// Dense slot index, `0..ALL.len()`.
    pub fn index(self) -> usize {
        match self {
            TimerKind::QrRefresh => 0,
            TimerKind::Heartbeat => 1,
            TimerKind::Reconnect => 2,
            TimerKind::SessionGrace => 3,
            TimerKind::CommandSettle => 4,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(attempt-1), cap)`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Every delay and ceiling the state machine works with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    pub qr_refresh_ms: u64,
    pub heartbeat_ms: u64,
    pub session_grace_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub restart_settle_ms: u64,
    pub logout_settle_ms: u64,
    pub destroy_settle_ms: u64,
    pub redirect_delay_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            qr_refresh_ms: QR_REFRESH_INTERVAL_MS,
            heartbeat_ms: HEARTBEAT_INTERVAL_MS,
            session_grace_ms: SESSION_GRACE_MS,
            reconnect_base_ms: RECONNECT_BASE_DELAY_MS,
            reconnect_max_ms: RECONNECT_MAX_DELAY_MS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            restart_settle_ms: RESTART_SETTLE_MS,
            logout_settle_ms: LOGOUT_SETTLE_MS,
            destroy_settle_ms: DESTROY_SETTLE_MS,
            redirect_delay_ms: REDIRECT_DELAY_MS,
        }
    }
}

impl Timings {
    pub fn qr_refresh(&self) -> Duration {
        Duration::from_millis(self.qr_refresh_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.redirect_delay_ms)
    }

    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        reconnect_delay(
            attempt,
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

/// Which timers the state machine currently considers armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmedTimers {
    slots: [bool; TimerKind::ALL.len()],
}

impl ArmedTimers {
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()]
    }

    pub(crate) fn set(&mut self, kind: TimerKind, armed: bool) {
        self.slots[kind.index()] = armed;
    }

    pub fn armed(&self) -> impl Iterator<Item = TimerKind> + '_ {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| self.is_armed(*kind))
    }
}
