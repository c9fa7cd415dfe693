use tokio::sync::mpsc;
use waauth_core::SessionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Transition {
        previous: SessionState,
        current: SessionState,
    },
    QrDisplayed(String),
}

/// Read-only subscriber to session changes.
///
/// Called on the supervisor task, synchronously and in the order changes
/// happen; implementations must not block.
pub trait SessionObserver: Send {
    fn notify(&mut self, notification: &Notification);
}

/// Forwards every notification to an async consumer.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionObserver for ChannelObserver {
    fn notify(&mut self, notification: &Notification) {
        let _ = self.tx.send(notification.clone());
    }
}

#[derive(Default)]
pub struct Observers {
    list: Vec<Box<dyn SessionObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Box<dyn SessionObserver>) {
        self.list.push(observer);
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn publish(&mut self, notification: &Notification) {
        for observer in &mut self.list {
            observer.notify(notification);
        }
    }
}
