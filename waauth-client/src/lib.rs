use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod observer;
pub mod redirect;
pub mod supervisor;
pub mod timers;
pub mod transport;

pub use api::{ApiError, GatewayApi};
pub use config::{ClientArgs, ClientConfig, ConfigError};
pub use observer::{ChannelObserver, Notification, Observers, SessionObserver};
pub use redirect::{RedirectObserver, completion_url};
pub use supervisor::{Command, Supervisor, SupervisorError, SupervisorHandle};

pub fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as u64
}
