//! Event loop that drives the [`AuthMachine`].
//!
//! Transport events, timer firings, REST results and handle commands are all
//! consumed by one task, so the machine never runs concurrently with itself.

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use waauth_core::{
    AuthMachine, CoreError, Effect, Event, InboundMessage, SessionCommand, SessionState,
    TimerKind, decode_inbound,
};

use crate::{
    api::{ApiError, GatewayApi},
    config::ClientConfig,
    now_unix_ms,
    observer::{Notification, Observers},
    timers::{TimerFiring, TimerSet},
    transport::{Transport, TransportEvent, TransportEventKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Retry,
    Refresh,
    Session(SessionCommand),
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("supervisor has stopped")]
    Stopped,
}

#[derive(Debug)]
enum ApiResult {
    Qr(Result<Option<String>, String>),
    Command {
        command: SessionCommand,
        outcome: Result<(), String>,
    },
}

/// Cloneable front door to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
}

impl SupervisorHandle {
    pub fn send(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .map_err(|_| SupervisorError::Stopped)
    }

    pub fn retry(&self) -> Result<(), SupervisorError> {
        self.send(Command::Retry)
    }

    pub fn refresh(&self) -> Result<(), SupervisorError> {
        self.send(Command::Refresh)
    }

    pub fn restart(&self) -> Result<(), SupervisorError> {
        self.send(Command::Session(SessionCommand::Restart))
    }

    pub fn logout(&self) -> Result<(), SupervisorError> {
        self.send(Command::Session(SessionCommand::Logout))
    }

    pub fn destroy_session(&self) -> Result<(), SupervisorError> {
        self.send(Command::Session(SessionCommand::Destroy))
    }

    /// Cancels every timer, closes the socket and stops the loop.
    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

pub struct Supervisor {
    config: ClientConfig,
    machine: AuthMachine,
    transport: Transport,
    timers: TimerSet,
    api: GatewayApi,
    observers: Observers,
    state_tx: watch::Sender<SessionState>,
    results_tx: mpsc::UnboundedSender<ApiResult>,
}

struct Inputs {
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerFiring>,
    results_rx: mpsc::UnboundedReceiver<ApiResult>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl Supervisor {
    /// Starts the supervisor task; it connects immediately.
    pub fn spawn(
        config: ClientConfig,
        observers: Observers,
    ) -> Result<(SupervisorHandle, JoinHandle<()>), ApiError> {
        let api = GatewayApi::new(config.api_base_url.clone(), config.http_timeout)?;

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let machine = AuthMachine::new(config.timings);
        let (state_tx, state_rx) = watch::channel(machine.state().clone());

        let supervisor = Supervisor {
            transport: Transport::new(transport_tx).with_connect_timeout(config.connect_timeout),
            timers: TimerSet::new(timer_tx),
            machine,
            api,
            observers,
            state_tx,
            results_tx,
            config,
        };

        let inputs = Inputs {
            transport_rx,
            timer_rx,
            results_rx,
            command_rx,
        };
        let task = tokio::spawn(supervisor.run(inputs));

        Ok((
            SupervisorHandle {
                commands: command_tx,
                state_rx,
            },
            task,
        ))
    }

    async fn run(mut self, mut inputs: Inputs) {
        info!(
            gateway_url = %self.config.gateway_url,
            api_base_url = %self.config.api_base_url,
            observers = self.observers.len(),
            "supervisor starting"
        );

        let initial = self.machine.state().clone();
        let effects = self.machine.start();
        self.apply(initial, effects);

        loop {
            let event = tokio::select! {
                Some(event) = inputs.transport_rx.recv() => self.transport_event(event),
                Some(firing) = inputs.timer_rx.recv() => self.timer_event(firing),
                Some(result) = inputs.results_rx.recv() => Some(api_event(result)),
                command = inputs.command_rx.recv() => match command {
                    Some(Command::Retry) => Some(Event::Retry),
                    Some(Command::Refresh) => Some(Event::Refresh),
                    Some(Command::Session(command)) => Some(Event::Command(command)),
                    Some(Command::Shutdown) | None => break,
                },
                else => break,
            };

            if let Some(event) = event {
                self.dispatch(event);
            }
        }

        self.dispatch(Event::Destroy);
        self.timers.cancel_all();
        self.transport.close();
        info!("supervisor stopped");
    }

    fn dispatch(&mut self, event: Event) {
        let previous = self.machine.state().clone();
        debug!(phase = %previous.phase, event = ?event, "handling event");
        let effects = self.machine.handle(event);
        self.apply(previous, effects);
    }

    fn apply(&mut self, previous: SessionState, effects: Vec<Effect>) {
        let mut displayed = Vec::new();
        for effect in effects {
            match effect {
                Effect::Connect => {
                    let url = self.config.connection_url(now_unix_ms());
                    self.transport.connect(url.as_str());
                }
                Effect::CloseTransport => self.transport.close(),
                Effect::Send(kind) => {
                    let message = kind.stamp(now_unix_ms());
                    if let Err(err) = self.transport.send(&message) {
                        warn!(message = message.type_name(), "send dropped: {err}");
                    }
                }
                Effect::Arm { timer, delay } => {
                    if timer == TimerKind::Reconnect {
                        info!(
                            attempt = self.machine.state().connection_attempts + 1,
                            delay_ms = delay.as_millis() as u64,
                            "reconnect scheduled"
                        );
                    }
                    self.timers.arm(timer, delay);
                }
                Effect::Cancel(timer) => self.timers.cancel(timer),
                Effect::FetchQr => self.spawn_qr_fetch(),
                Effect::DisplayQr(qr) => displayed.push(qr),
                Effect::InvokeCommand(command) => self.spawn_command(command),
            }
        }

        let current = self.machine.state().clone();
        let violations = current.invariant_violations();
        if !violations.is_empty() {
            error!(?violations, "session state invariants violated");
        }

        if previous != current {
            if previous.phase != current.phase {
                info!(
                    from = %previous.phase,
                    to = %current.phase,
                    attempts = current.connection_attempts,
                    last_error = current.last_error.as_deref().unwrap_or(""),
                    "phase changed"
                );
            }
            self.state_tx.send_replace(current.clone());
            self.observers.publish(&Notification::Transition {
                previous,
                current,
            });
        }

        for qr in displayed {
            self.observers.publish(&Notification::QrDisplayed(qr));
        }
    }

    fn transport_event(&self, event: TransportEvent) -> Option<Event> {
        if !self.transport.is_current(event.connection) {
            debug!(connection = event.connection, "ignoring event from stale connection");
            return None;
        }

        match event.kind {
            TransportEventKind::Opened => Some(Event::TransportOpened),
            TransportEventKind::Closed(reason) => {
                info!(reason = reason.as_deref().unwrap_or(""), "socket closed");
                Some(Event::TransportClosed { reason })
            }
            TransportEventKind::Error(detail) => {
                warn!("socket error: {detail}");
                Some(Event::TransportError(detail))
            }
            TransportEventKind::MessageReceived(text) => inbound_event(&text),
        }
    }

    fn timer_event(&mut self, firing: TimerFiring) -> Option<Event> {
        if !self.timers.accept(firing) {
            debug!(timer = firing.kind.as_str(), "dropping stale timer firing");
            return None;
        }
        Some(Event::TimerFired(firing.kind))
    }

    fn spawn_qr_fetch(&self) {
        let api = self.api.clone();
        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_qr().await.map_err(|err| err.to_string());
            let _ = results_tx.send(ApiResult::Qr(result));
        });
    }

    fn spawn_command(&self, command: SessionCommand) {
        info!(command = command.as_str(), "invoking session command");
        let api = self.api.clone();
        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            let outcome = api.run_command(command).await.map_err(|err| err.to_string());
            let _ = results_tx.send(ApiResult::Command { command, outcome });
        });
    }
}

fn inbound_event(text: &str) -> Option<Event> {
    match decode_inbound(text) {
        Ok(message) => {
            debug!(message = message.type_name(), "received");
            if let InboundMessage::InitialState(initial) = &message
                && let Some(err) = initial.error.as_deref()
            {
                warn!("gateway reported initial state error: {err}");
            }
            Some(Event::MessageReceived(message))
        }
        Err(CoreError::UnrecognizedType(message_type)) => {
            debug!(message = %message_type, "ignoring unrecognized message");
            None
        }
        Err(err) => {
            warn!("dropping inbound message: {err}");
            None
        }
    }
}

fn api_event(result: ApiResult) -> Event {
    match result {
        ApiResult::Qr(Ok(qr)) => Event::QrFetched(qr),
        ApiResult::Qr(Err(err)) => {
            warn!("qr fetch failed: {err}");
            Event::QrFetched(None)
        }
        ApiResult::Command { command, outcome } => {
            if let Err(err) = &outcome {
                warn!(command = command.as_str(), "session command failed: {err}");
            }
            Event::CommandCompleted { command, outcome }
        }
    }
}
