use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;
use url::Url;
use waauth_core::ConnectionPhase;

use crate::{
    now_unix_ms,
    observer::{Notification, SessionObserver},
};

pub const AUTH_COMPLETED_PARAM: &str = "authCompleted";

/// `return_to` with `authCompleted=<completed_at_ms>` appended.
pub fn completion_url(return_to: &Url, completed_at_ms: u64) -> Url {
    let mut url = return_to.clone();
    url.query_pairs_mut()
        .append_pair(AUTH_COMPLETED_PARAM, &completed_at_ms.to_string());
    url
}

/// Navigates back to `return_to` a short while after authentication.
///
/// Leaving `Authenticated` before the delay elapses cancels the redirect.
pub struct RedirectObserver {
    return_to: Url,
    delay: Duration,
    tx: mpsc::UnboundedSender<Url>,
    pending: Option<JoinHandle<()>>,
}

impl RedirectObserver {
    pub fn new(return_to: Url, delay: Duration) -> (Self, mpsc::UnboundedReceiver<Url>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                return_to,
                delay,
                tx,
                pending: None,
            },
            rx,
        )
    }

    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

impl SessionObserver for RedirectObserver {
    fn notify(&mut self, notification: &Notification) {
        let Notification::Transition { previous, current } = notification else {
            return;
        };

        if current.phase != ConnectionPhase::Authenticated {
            self.cancel_pending();
            return;
        }
        if previous.phase == ConnectionPhase::Authenticated {
            return;
        }

        self.cancel_pending();
        let return_to = self.return_to.clone();
        let delay = self.delay;
        let tx = self.tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let url = completion_url(&return_to, now_unix_ms());
            info!(url = %url, "authentication complete, redirecting");
            let _ = tx.send(url);
        }));
    }
}

impl Drop for RedirectObserver {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
