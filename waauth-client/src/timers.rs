use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::trace;
use waauth_core::{TimerKind, TimerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFiring {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    task: JoinHandle<()>,
}

/// Named, independently cancellable timers backed by tokio tasks.
///
/// Arming a timer always aborts the previous instance of the same kind, and
/// every firing carries the generation it was armed with so a firing that
/// was already queued when its timer got cancelled can be recognised.
pub struct TimerSet {
    fired_tx: mpsc::UnboundedSender<TimerFiring>,
    slots: [Option<Slot>; TimerKind::ALL.len()],
    next_generation: u64,
}

impl TimerSet {
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFiring>) -> Self {
        Self {
            fired_tx,
            slots: Default::default(),
            next_generation: 0,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let fired_tx = self.fired_tx.clone();
        let firing = TimerFiring { kind, generation };

        let task = match kind.mode() {
            TimerMode::OneShot => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = fired_tx.send(firing);
            }),
            TimerMode::Interval => tokio::spawn(async move {
                let mut ticker = tokio::time::interval(delay.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await; // skip first immediate tick
                loop {
                    ticker.tick().await;
                    if fired_tx.send(firing).is_err() {
                        break;
                    }
                }
            }),
        };

        trace!(timer = kind.as_str(), generation, delay_ms = delay.as_millis() as u64, "armed");
        self.slots[kind.index()] = Some(Slot { generation, task });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots[kind.index()].take() {
            slot.task.abort();
            trace!(timer = kind.as_str(), generation = slot.generation, "cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Accepts a firing if it belongs to the currently armed instance.
    ///
    /// A one-shot timer is released once its firing is accepted.
    pub fn accept(&mut self, firing: TimerFiring) -> bool {
        let index = firing.kind.index();
        let current = self.slots[index]
            .as_ref()
            .is_some_and(|slot| slot.generation == firing.generation);
        if current && firing.kind.mode() == TimerMode::OneShot {
            self.slots[index] = None;
        }
        current
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
