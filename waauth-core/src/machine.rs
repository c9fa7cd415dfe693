//! Authentication and connection-supervision state machine.
//!
//! [`AuthMachine::handle`] is the only way the [`SessionState`] changes. It
//! performs no I/O: every side effect is returned as an [`Effect`] for the
//! driver to execute in order.

use std::time::Duration;

use crate::session::{ConnectionPhase, SessionState};
use crate::timer::{ArmedTimers, TimerKind, TimerMode, Timings};
use crate::wire::{ClientReady, InboundMessage, InitialState, OutboundKind, QrUpdated};

pub const EXHAUSTED_RETRY_MESSAGE: &str = "Unable to maintain connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCommand {
    Restart,
    Destroy,
    Logout,
}

impl SessionCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionCommand::Restart => "restart",
            SessionCommand::Destroy => "destroy",
            SessionCommand::Logout => "logout",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            SessionCommand::Restart => "/api/wa/restart",
            SessionCommand::Destroy => "/api/wa/destroy",
            SessionCommand::Logout => "/api/wa/logout",
        }
    }

    pub fn settle_delay(self, timings: &Timings) -> Duration {
        let millis = match self {
            SessionCommand::Restart => timings.restart_settle_ms,
            SessionCommand::Destroy => timings.destroy_settle_ms,
            SessionCommand::Logout => timings.logout_settle_ms,
        };
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TransportOpened,
    MessageReceived(InboundMessage),
    TransportClosed { reason: Option<String> },
    TransportError(String),
    TimerFired(TimerKind),
    /// Result of the REST QR fetch; `None` when the gateway had no QR yet.
    QrFetched(Option<String>),
    Retry,
    Refresh,
    Command(SessionCommand),
    CommandCompleted {
        command: SessionCommand,
        outcome: Result<(), String>,
    },
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect,
    CloseTransport,
    Send(OutboundKind),
    Arm { timer: TimerKind, delay: Duration },
    Cancel(TimerKind),
    FetchQr,
    DisplayQr(String),
    InvokeCommand(SessionCommand),
}

#[derive(Debug, Clone)]
pub struct AuthMachine {
    state: SessionState,
    timings: Timings,
    timers: ArmedTimers,
    transport_open: bool,
    destroyed: bool,
}

impl AuthMachine {
    pub fn new(timings: Timings) -> Self {
        Self {
            state: SessionState::new(),
            timings,
            timers: ArmedTimers::default(),
            transport_open: false,
            destroyed: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase
    }

    pub fn timers(&self) -> &ArmedTimers {
        &self.timers
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn is_transport_open(&self) -> bool {
        self.transport_open
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Effects that bring a freshly constructed machine online.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.destroyed {
            return Vec::new();
        }
        vec![Effect::Connect]
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.destroyed {
            return fx;
        }

        match event {
            Event::TransportOpened => self.on_opened(&mut fx),
            Event::MessageReceived(message) => self.on_message(message, &mut fx),
            Event::TransportClosed { .. } | Event::TransportError(_) => {
                self.on_transport_lost(&mut fx)
            }
            Event::TimerFired(kind) => self.on_timer(kind, &mut fx),
            Event::QrFetched(qr) => self.on_qr_fetched(qr, &mut fx),
            Event::Retry => self.on_retry(&mut fx),
            Event::Refresh => self.on_refresh(&mut fx),
            Event::Command(command) => fx.push(Effect::InvokeCommand(command)),
            Event::CommandCompleted { command, outcome } => {
                self.on_command_completed(command, outcome, &mut fx)
            }
            Event::Destroy => self.on_destroy(&mut fx),
        }

        fx
    }

    fn on_opened(&mut self, fx: &mut Vec<Effect>) {
        if !matches!(
            self.state.phase,
            ConnectionPhase::Initializing | ConnectionPhase::Connecting
        ) {
            // Nothing in this phase is waiting for a socket.
            fx.push(Effect::CloseTransport);
            return;
        }

        self.transport_open = true;
        self.state.connection_attempts = 0;
        self.state.client_ready = false;
        self.disarm(TimerKind::Reconnect, fx);
        self.set_phase(ConnectionPhase::Connected, fx);
        fx.push(Effect::Send(OutboundKind::HeartbeatPing));
        fx.push(Effect::Send(OutboundKind::RequestInitialState));
        self.arm(TimerKind::Heartbeat, self.timings.heartbeat(), fx);
    }

    fn on_message(&mut self, message: InboundMessage, fx: &mut Vec<Effect>) {
        if !self.transport_open {
            return;
        }
        match message {
            InboundMessage::ClientReady(ready) => self.on_client_ready(&ready, fx),
            InboundMessage::QrUpdated(update) => self.on_qr_updated(update, fx),
            InboundMessage::InitialState(initial) => self.on_initial_state(initial, fx),
            InboundMessage::HeartbeatAck(_) => {}
        }
    }

    fn on_client_ready(&mut self, ready: &ClientReady, fx: &mut Vec<Effect>) {
        if ready.is_ready() {
            self.authenticate(fx);
        }
    }

    fn on_qr_updated(&mut self, update: QrUpdated, fx: &mut Vec<Effect>) {
        if self.state.client_ready || update.qr.is_empty() {
            return;
        }
        match self.state.phase {
            ConnectionPhase::QrRequired => {
                self.state.qr_payload = Some(update.qr.clone());
                fx.push(Effect::DisplayQr(update.qr));
            }
            ConnectionPhase::CheckingSession => {
                self.state.qr_payload = Some(update.qr);
            }
            ConnectionPhase::Connected => {
                self.begin_session_check(Some(update.qr), fx);
            }
            _ => {}
        }
    }

    fn on_initial_state(&mut self, initial: InitialState, fx: &mut Vec<Effect>) {
        let qr = initial.qr().map(str::to_owned);
        match self.state.phase {
            ConnectionPhase::Connected => {
                if initial.is_ready() {
                    self.authenticate(fx);
                } else {
                    self.begin_session_check(qr, fx);
                }
            }
            ConnectionPhase::CheckingSession => {
                if initial.is_ready() {
                    self.authenticate(fx);
                } else if qr.is_some() {
                    self.state.qr_payload = qr;
                }
            }
            ConnectionPhase::QrRequired => {
                if initial.is_ready() {
                    self.authenticate(fx);
                } else if let Some(qr) = qr {
                    self.state.qr_payload = Some(qr.clone());
                    fx.push(Effect::DisplayQr(qr));
                }
            }
            _ => {}
        }
    }

    fn begin_session_check(&mut self, qr: Option<String>, fx: &mut Vec<Effect>) {
        self.set_phase(ConnectionPhase::CheckingSession, fx);
        self.state.qr_payload = qr;
        self.arm(TimerKind::SessionGrace, self.timings.session_grace(), fx);
    }

    fn authenticate(&mut self, fx: &mut Vec<Effect>) {
        self.state.client_ready = true;
        self.disarm(TimerKind::CommandSettle, fx);
        self.set_phase(ConnectionPhase::Authenticated, fx);
    }

    fn on_transport_lost(&mut self, fx: &mut Vec<Effect>) {
        self.transport_open = false;
        self.state.client_ready = false;
        self.disarm(TimerKind::Heartbeat, fx);

        if self.state.phase == ConnectionPhase::Error || self.timers.is_armed(TimerKind::Reconnect)
        {
            return;
        }

        if self.state.connection_attempts >= self.timings.max_reconnect_attempts {
            self.exhaust(fx);
            return;
        }

        self.disarm(TimerKind::CommandSettle, fx);
        self.set_phase(ConnectionPhase::Disconnected, fx);
        let delay = self
            .timings
            .reconnect_delay(self.state.connection_attempts.saturating_add(1));
        self.arm(TimerKind::Reconnect, delay, fx);
    }

    fn on_timer(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        if !self.timers.is_armed(kind) {
            return;
        }
        if kind.mode() == TimerMode::OneShot {
            self.timers.set(kind, false);
        }

        match kind {
            TimerKind::QrRefresh => {
                if self.state.phase == ConnectionPhase::QrRequired && self.transport_open {
                    fx.push(Effect::Send(OutboundKind::RequestInitialState));
                }
            }
            TimerKind::Heartbeat => {
                if self.transport_open {
                    fx.push(Effect::Send(OutboundKind::HeartbeatPing));
                }
            }
            TimerKind::Reconnect => {
                self.state.connection_attempts = self.state.connection_attempts.saturating_add(1);
                if self.state.connection_attempts > self.timings.max_reconnect_attempts {
                    self.exhaust(fx);
                    return;
                }
                self.set_phase(ConnectionPhase::Connecting, fx);
                fx.push(Effect::Connect);
            }
            TimerKind::SessionGrace => {
                if self.state.phase != ConnectionPhase::CheckingSession {
                    return;
                }
                self.set_phase(ConnectionPhase::QrRequired, fx);
                match self.state.qr_payload.clone() {
                    Some(qr) => fx.push(Effect::DisplayQr(qr)),
                    None => fx.push(Effect::FetchQr),
                }
                self.arm(TimerKind::QrRefresh, self.timings.qr_refresh(), fx);
            }
            TimerKind::CommandSettle => {
                if self.state.phase != ConnectionPhase::Initializing {
                    return;
                }
                if self.transport_open {
                    self.set_phase(ConnectionPhase::Connected, fx);
                    fx.push(Effect::Send(OutboundKind::RequestInitialState));
                } else if !self.timers.is_armed(TimerKind::Reconnect) {
                    // Initial state is requested once the socket opens.
                    self.state.connection_attempts = 0;
                    fx.push(Effect::Connect);
                }
            }
        }
    }

    fn on_qr_fetched(&mut self, qr: Option<String>, fx: &mut Vec<Effect>) {
        let Some(qr) = qr.filter(|qr| !qr.is_empty()) else {
            return;
        };
        // A QR pushed over the socket while the fetch was in flight is newer.
        if self.state.phase != ConnectionPhase::QrRequired
            || self.state.client_ready
            || self.state.qr_payload.is_some()
        {
            return;
        }
        self.state.qr_payload = Some(qr.clone());
        fx.push(Effect::DisplayQr(qr));
    }

    fn on_retry(&mut self, fx: &mut Vec<Effect>) {
        self.state.connection_attempts = 0;
        self.state.client_ready = false;
        self.transport_open = false;
        self.disarm_all(fx);
        self.set_phase(ConnectionPhase::Initializing, fx);
        fx.push(Effect::CloseTransport);
        fx.push(Effect::Connect);
    }

    fn on_refresh(&mut self, fx: &mut Vec<Effect>) {
        if !self.transport_open {
            return;
        }
        match self.state.phase {
            ConnectionPhase::Connected | ConnectionPhase::CheckingSession => {
                fx.push(Effect::Send(OutboundKind::RequestInitialState));
            }
            ConnectionPhase::QrRequired => {
                fx.push(Effect::Send(OutboundKind::RequestInitialState));
                fx.push(Effect::FetchQr);
            }
            _ => {}
        }
    }

    fn on_command_completed(
        &mut self,
        command: SessionCommand,
        outcome: Result<(), String>,
        fx: &mut Vec<Effect>,
    ) {
        match outcome {
            Ok(()) => {
                self.state.client_ready = false;
                self.set_phase(ConnectionPhase::Initializing, fx);
                self.arm(TimerKind::CommandSettle, command.settle_delay(&self.timings), fx);
            }
            Err(message) => {
                self.set_phase(ConnectionPhase::Error, fx);
                self.state.last_error = Some(message);
            }
        }
    }

    fn on_destroy(&mut self, fx: &mut Vec<Effect>) {
        self.disarm_all(fx);
        self.transport_open = false;
        self.state.client_ready = false;
        self.set_phase(ConnectionPhase::Disconnected, fx);
        self.destroyed = true;
        fx.push(Effect::CloseTransport);
    }

    fn exhaust(&mut self, fx: &mut Vec<Effect>) {
        self.set_phase(ConnectionPhase::Error, fx);
        self.state.last_error = Some(EXHAUSTED_RETRY_MESSAGE.to_owned());
    }

    /// Moves to `next` and restores the phase-bound invariants.
    fn set_phase(&mut self, next: ConnectionPhase, fx: &mut Vec<Effect>) {
        self.state.phase = next;
        if !next.is_qr_phase() {
            self.state.qr_payload = None;
        }
        if next != ConnectionPhase::QrRequired {
            self.disarm(TimerKind::QrRefresh, fx);
        }
        if next != ConnectionPhase::CheckingSession {
            self.disarm(TimerKind::SessionGrace, fx);
        }
        if next == ConnectionPhase::Error {
            self.disarm(TimerKind::Reconnect, fx);
            self.disarm(TimerKind::CommandSettle, fx);
        } else {
            self.state.last_error = None;
        }
    }

    fn arm(&mut self, timer: TimerKind, delay: Duration, fx: &mut Vec<Effect>) {
        self.timers.set(timer, true);
        fx.push(Effect::Arm { timer, delay });
    }

    fn disarm(&mut self, timer: TimerKind, fx: &mut Vec<Effect>) {
        if self.timers.is_armed(timer) {
            self.timers.set(timer, false);
            fx.push(Effect::Cancel(timer));
        }
    }

    fn disarm_all(&mut self, fx: &mut Vec<Effect>) {
        for timer in TimerKind::ALL {
            self.disarm(timer, fx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> AuthMachine {
        AuthMachine::new(Timings::default())
    }

    fn connected() -> AuthMachine {
        let mut machine = machine();
        machine.start();
        machine.handle(Event::TransportOpened);
        machine
    }

    fn initial_state(client_ready: Option<bool>, qr: Option<&str>) -> Event {
        Event::MessageReceived(InboundMessage::InitialState(InitialState {
            client_ready,
            qr: qr.map(str::to_owned),
            error: None,
        }))
    }

    fn qr_updated(qr: &str) -> Event {
        Event::MessageReceived(InboundMessage::QrUpdated(QrUpdated { qr: qr.to_owned() }))
    }

    fn client_ready() -> Event {
        Event::MessageReceived(InboundMessage::ClientReady(ClientReady {
            client_ready: Some(true),
            state: None,
        }))
    }

    fn closed() -> Event {
        Event::TransportClosed { reason: None }
    }

    fn assert_consistent(machine: &AuthMachine) {
        let violations = machine.state().invariant_violations();
        assert!(violations.is_empty(), "invariants violated: {violations:?}");
        assert_eq!(
            machine.timers().is_armed(TimerKind::QrRefresh),
            machine.phase() == ConnectionPhase::QrRequired,
            "qr refresh timer armed state disagrees with phase {}",
            machine.phase()
        );
    }

    #[test]
    fn start_requests_connection() {
        let mut machine = machine();
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);
        assert_eq!(machine.start(), vec![Effect::Connect]);
    }

    #[test]
    fn open_sends_ping_requests_state_and_arms_heartbeat() {
        let mut machine = machine();
        machine.start();
        let fx = machine.handle(Event::TransportOpened);

        assert_eq!(machine.phase(), ConnectionPhase::Connected);
        assert_eq!(
            fx,
            vec![
                Effect::Send(OutboundKind::HeartbeatPing),
                Effect::Send(OutboundKind::RequestInitialState),
                Effect::Arm {
                    timer: TimerKind::Heartbeat,
                    delay: Duration::from_millis(30_000),
                },
            ]
        );
        assert!(machine.timers().is_armed(TimerKind::Heartbeat));
    }

    #[test]
    fn scenario_ready_initial_state_authenticates_without_qr() {
        let mut machine = connected();
        let mut visited = vec![machine.phase()];

        machine.handle(initial_state(Some(true), None));
        visited.push(machine.phase());

        assert_eq!(machine.phase(), ConnectionPhase::Authenticated);
        assert!(machine.state().client_ready);
        assert!(!visited.contains(&ConnectionPhase::QrRequired));
        assert_consistent(&machine);
    }

    #[test]
    fn scenario_pushed_qr_is_shown_after_grace_without_fetch() {
        let mut machine = connected();
        let fx = machine.handle(initial_state(None, Some("qr-data")));
        assert_eq!(machine.phase(), ConnectionPhase::CheckingSession);
        assert_eq!(machine.state().qr_payload.as_deref(), Some("qr-data"));
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::SessionGrace,
            delay: Duration::from_millis(3_000),
        }));
        assert!(!fx.iter().any(|effect| matches!(effect, Effect::DisplayQr(_))));

        let fx = machine.handle(Event::TimerFired(TimerKind::SessionGrace));
        assert_eq!(machine.phase(), ConnectionPhase::QrRequired);
        assert!(fx.contains(&Effect::DisplayQr("qr-data".to_owned())));
        assert!(!fx.contains(&Effect::FetchQr));
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::QrRefresh,
            delay: Duration::from_millis(30_000),
        }));
        assert_consistent(&machine);
    }

    #[test]
    fn scenario_ready_within_grace_never_renders_qr() {
        let mut machine = connected();
        let mut all_effects = machine.handle(initial_state(None, Some("qr-data")));
        all_effects.extend(machine.handle(client_ready()));

        assert_eq!(machine.phase(), ConnectionPhase::Authenticated);
        assert!(all_effects.contains(&Effect::Cancel(TimerKind::SessionGrace)));
        assert!(!machine.timers().is_armed(TimerKind::SessionGrace));

        // A grace firing that raced the cancel changes nothing.
        all_effects.extend(machine.handle(Event::TimerFired(TimerKind::SessionGrace)));
        assert_eq!(machine.phase(), ConnectionPhase::Authenticated);
        assert!(
            !all_effects
                .iter()
                .any(|effect| matches!(effect, Effect::DisplayQr(_) | Effect::FetchQr))
        );
        assert_eq!(machine.state().qr_payload, None);
        assert_consistent(&machine);
    }

    #[test]
    fn empty_initial_state_fetches_qr_after_grace() {
        let mut machine = connected();
        machine.handle(initial_state(None, None));
        assert_eq!(machine.phase(), ConnectionPhase::CheckingSession);
        assert_eq!(machine.state().qr_payload, None);

        let fx = machine.handle(Event::TimerFired(TimerKind::SessionGrace));
        assert_eq!(machine.phase(), ConnectionPhase::QrRequired);
        assert!(fx.contains(&Effect::FetchQr));

        let fx = machine.handle(Event::QrFetched(Some("fetched".to_owned())));
        assert_eq!(fx, vec![Effect::DisplayQr("fetched".to_owned())]);
        assert_eq!(machine.state().qr_payload.as_deref(), Some("fetched"));

        // 404 from the QR endpoint leaves the state untouched.
        let before = machine.state().clone();
        assert!(machine.handle(Event::QrFetched(None)).is_empty());
        assert_eq!(machine.state(), &before);
    }

    #[test]
    fn qr_updates_redisplay_while_required() {
        let mut machine = connected();
        machine.handle(initial_state(None, Some("first")));
        machine.handle(Event::TimerFired(TimerKind::SessionGrace));

        let fx = machine.handle(qr_updated("second"));
        assert_eq!(machine.phase(), ConnectionPhase::QrRequired);
        assert_eq!(machine.state().qr_payload.as_deref(), Some("second"));
        assert_eq!(fx, vec![Effect::DisplayQr("second".to_owned())]);
    }

    #[test]
    fn qr_refresh_reissues_initial_state_request() {
        let mut machine = connected();
        machine.handle(initial_state(None, Some("qr")));
        machine.handle(Event::TimerFired(TimerKind::SessionGrace));

        for _ in 0..3 {
            let fx = machine.handle(Event::TimerFired(TimerKind::QrRefresh));
            assert_eq!(fx, vec![Effect::Send(OutboundKind::RequestInitialState)]);
            assert!(machine.timers().is_armed(TimerKind::QrRefresh));
        }

        let fx = machine.handle(client_ready());
        assert!(fx.contains(&Effect::Cancel(TimerKind::QrRefresh)));
        assert!(machine.handle(Event::TimerFired(TimerKind::QrRefresh)).is_empty());
        assert_consistent(&machine);
    }

    #[test]
    fn authenticated_ignores_stray_qr_updates() {
        let mut machine = connected();
        machine.handle(initial_state(Some(true), None));
        let snapshot = machine.state().clone();

        for qr in ["late-1", "late-2", "late-3"] {
            assert!(machine.handle(qr_updated(qr)).is_empty());
            assert!(
                machine
                    .handle(initial_state(None, Some(qr)))
                    .is_empty()
            );
            assert_eq!(machine.state(), &snapshot);
        }
    }

    #[test]
    fn client_ready_wins_from_connected() {
        let mut machine = connected();
        machine.handle(client_ready());
        assert_eq!(machine.phase(), ConnectionPhase::Authenticated);
    }

    #[test]
    fn not_ready_client_ready_message_is_ignored() {
        let mut machine = connected();
        machine.handle(initial_state(None, Some("qr")));
        let fx = machine.handle(Event::MessageReceived(InboundMessage::ClientReady(
            ClientReady {
                client_ready: Some(false),
                state: Some("initializing".to_owned()),
            },
        )));
        assert!(fx.is_empty());
        assert_eq!(machine.phase(), ConnectionPhase::CheckingSession);
    }

    #[test]
    fn close_schedules_reconnect_with_backoff() {
        let mut machine = connected();
        machine.handle(initial_state(Some(true), None));

        let fx = machine.handle(closed());
        assert_eq!(machine.phase(), ConnectionPhase::Disconnected);
        assert!(fx.contains(&Effect::Cancel(TimerKind::Heartbeat)));
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::Reconnect,
            delay: Duration::from_millis(500),
        }));
        assert!(!machine.state().client_ready);

        // An error reported for the same connection does not schedule twice.
        assert!(
            machine
                .handle(Event::TransportError("reset".to_owned()))
                .is_empty()
        );

        let fx = machine.handle(Event::TimerFired(TimerKind::Reconnect));
        assert_eq!(machine.phase(), ConnectionPhase::Connecting);
        assert_eq!(machine.state().connection_attempts, 1);
        assert_eq!(fx, vec![Effect::Connect]);

        let fx = machine.handle(Event::TransportError("refused".to_owned()));
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::Reconnect,
            delay: Duration::from_millis(1_000),
        }));
    }

    #[test]
    fn successful_reconnect_resets_attempts_once() {
        let mut machine = connected();
        for _ in 0..4 {
            machine.handle(closed());
            machine.handle(Event::TimerFired(TimerKind::Reconnect));
        }
        assert_eq!(machine.state().connection_attempts, 4);

        machine.handle(Event::TransportOpened);
        assert_eq!(machine.phase(), ConnectionPhase::Connected);
        assert_eq!(machine.state().connection_attempts, 0);
        assert_consistent(&machine);
    }

    #[test]
    fn attempts_never_decrease_across_closes() {
        let mut machine = connected();
        let mut last = machine.state().connection_attempts;
        for step in 0..40 {
            let event = if step % 2 == 0 {
                closed()
            } else {
                Event::TimerFired(TimerKind::Reconnect)
            };
            machine.handle(event);
            let attempts = machine.state().connection_attempts;
            assert!(attempts >= last, "attempts decreased at step {step}");
            last = attempts;
            assert_consistent(&machine);
        }
    }

    #[test]
    fn scenario_eleven_closes_exhaust_retries() {
        let mut machine = machine();
        machine.start();
        machine.handle(Event::TransportOpened);

        let mut closes = 0;
        loop {
            let fx = machine.handle(closed());
            closes += 1;
            if machine.phase() == ConnectionPhase::Error {
                assert!(
                    !fx.iter()
                        .any(|effect| matches!(effect, Effect::Arm { timer: TimerKind::Reconnect, .. }))
                );
                break;
            }
            assert!(closes < 20, "machine never gave up");
            machine.handle(Event::TimerFired(TimerKind::Reconnect));
        }

        assert_eq!(closes, 11);
        assert_eq!(machine.state().connection_attempts, 10);
        assert_eq!(
            machine.state().last_error.as_deref(),
            Some(EXHAUSTED_RETRY_MESSAGE)
        );
        assert!(!machine.timers().is_armed(TimerKind::Reconnect));

        // Further transport noise never restarts automatic reconnects.
        assert!(machine.handle(closed()).is_empty());
        assert!(
            machine
                .handle(Event::TimerFired(TimerKind::Reconnect))
                .is_empty()
        );
        assert_eq!(machine.phase(), ConnectionPhase::Error);
    }

    #[test]
    fn reconnect_past_ceiling_enters_error() {
        let timings = Timings {
            max_reconnect_attempts: 2,
            ..Timings::default()
        };
        let mut machine = AuthMachine::new(timings);
        machine.start();
        machine.handle(closed());
        machine.handle(Event::TimerFired(TimerKind::Reconnect));
        machine.handle(closed());
        machine.handle(Event::TimerFired(TimerKind::Reconnect));
        assert_eq!(machine.state().connection_attempts, 2);
        machine.handle(closed());
        assert_eq!(machine.phase(), ConnectionPhase::Error);
    }

    #[test]
    fn scenario_retry_from_error_reconnects_immediately() {
        let mut machine = connected();
        for _ in 0..10 {
            machine.handle(closed());
            machine.handle(Event::TimerFired(TimerKind::Reconnect));
        }
        machine.handle(closed());
        assert_eq!(machine.phase(), ConnectionPhase::Error);

        let fx = machine.handle(Event::Retry);
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);
        assert_eq!(machine.state().connection_attempts, 0);
        assert_eq!(machine.state().last_error, None);
        assert_eq!(fx.last(), Some(&Effect::Connect));
        assert!(fx.contains(&Effect::CloseTransport));

        machine.handle(Event::TransportOpened);
        assert_eq!(machine.phase(), ConnectionPhase::Connected);
    }

    #[test]
    fn retry_cancels_every_armed_timer() {
        let mut machine = connected();
        machine.handle(initial_state(None, Some("qr")));
        machine.handle(Event::TimerFired(TimerKind::SessionGrace));
        assert!(machine.timers().is_armed(TimerKind::QrRefresh));
        assert!(machine.timers().is_armed(TimerKind::Heartbeat));

        let fx = machine.handle(Event::Retry);
        assert!(fx.contains(&Effect::Cancel(TimerKind::QrRefresh)));
        assert!(fx.contains(&Effect::Cancel(TimerKind::Heartbeat)));
        assert_eq!(machine.timers().armed().count(), 0);
        assert_consistent(&machine);
    }

    #[test]
    fn heartbeat_pings_only_while_open() {
        let mut machine = connected();
        assert_eq!(
            machine.handle(Event::TimerFired(TimerKind::Heartbeat)),
            vec![Effect::Send(OutboundKind::HeartbeatPing)]
        );
        machine.handle(closed());
        assert!(
            machine
                .handle(Event::TimerFired(TimerKind::Heartbeat))
                .is_empty()
        );
    }

    #[test]
    fn logout_success_resets_and_requests_after_settle() {
        let mut machine = connected();
        machine.handle(initial_state(Some(true), None));

        assert_eq!(
            machine.handle(Event::Command(SessionCommand::Logout)),
            vec![Effect::InvokeCommand(SessionCommand::Logout)]
        );
        let fx = machine.handle(Event::CommandCompleted {
            command: SessionCommand::Logout,
            outcome: Ok(()),
        });
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);
        assert!(!machine.state().client_ready);
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::CommandSettle,
            delay: Duration::from_millis(1_000),
        }));

        let fx = machine.handle(Event::TimerFired(TimerKind::CommandSettle));
        assert_eq!(machine.phase(), ConnectionPhase::Connected);
        assert_eq!(fx, vec![Effect::Send(OutboundKind::RequestInitialState)]);

        // After the reset a QR is accepted again.
        machine.handle(initial_state(None, Some("fresh")));
        assert_eq!(machine.phase(), ConnectionPhase::CheckingSession);
    }

    #[test]
    fn restart_settles_for_two_seconds() {
        let mut machine = connected();
        let fx = machine.handle(Event::CommandCompleted {
            command: SessionCommand::Restart,
            outcome: Ok(()),
        });
        assert!(fx.contains(&Effect::Arm {
            timer: TimerKind::CommandSettle,
            delay: Duration::from_millis(2_000),
        }));
    }

    #[test]
    fn failed_command_surfaces_error_without_touching_attempts() {
        let mut machine = connected();
        machine.handle(closed());
        machine.handle(Event::TimerFired(TimerKind::Reconnect));
        machine.handle(Event::TransportOpened);
        machine.handle(closed());
        machine.handle(Event::TimerFired(TimerKind::Reconnect));
        let attempts = machine.state().connection_attempts;

        machine.handle(Event::CommandCompleted {
            command: SessionCommand::Restart,
            outcome: Err("client not initialized".to_owned()),
        });
        assert_eq!(machine.phase(), ConnectionPhase::Error);
        assert_eq!(
            machine.state().last_error.as_deref(),
            Some("client not initialized")
        );
        assert_eq!(machine.state().connection_attempts, attempts);

        // The connect that was already in flight is shut instead of adopted.
        assert_eq!(
            machine.handle(Event::TransportOpened),
            vec![Effect::CloseTransport]
        );
        assert_eq!(machine.phase(), ConnectionPhase::Error);
        assert!(!machine.is_transport_open());
    }

    fn exhausted() -> AuthMachine {
        let mut machine = connected();
        machine.handle(closed());
        for _ in 0..10 {
            machine.handle(Event::TimerFired(TimerKind::Reconnect));
            machine.handle(Event::TransportError("connection refused".to_owned()));
        }
        assert_eq!(machine.phase(), ConnectionPhase::Error);
        assert!(!machine.is_transport_open());
        assert!(!machine.timers().is_armed(TimerKind::Reconnect));
        machine
    }

    #[test]
    fn restart_after_exhaustion_reconnects_once_settled() {
        let mut machine = exhausted();

        assert_eq!(
            machine.handle(Event::Command(SessionCommand::Restart)),
            vec![Effect::InvokeCommand(SessionCommand::Restart)]
        );
        machine.handle(Event::CommandCompleted {
            command: SessionCommand::Restart,
            outcome: Ok(()),
        });
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);
        assert_eq!(machine.state().last_error, None);

        let fx = machine.handle(Event::TimerFired(TimerKind::CommandSettle));
        assert_eq!(fx, vec![Effect::Connect]);
        assert_eq!(machine.state().connection_attempts, 0);
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);

        let fx = machine.handle(Event::TransportOpened);
        assert_eq!(machine.phase(), ConnectionPhase::Connected);
        assert!(fx.contains(&Effect::Send(OutboundKind::RequestInitialState)));
        assert_consistent(&machine);
    }

    #[test]
    fn command_success_with_reconnect_pending_keeps_backoff() {
        let mut machine = connected();
        machine.handle(closed());
        assert!(machine.timers().is_armed(TimerKind::Reconnect));

        machine.handle(Event::CommandCompleted {
            command: SessionCommand::Logout,
            outcome: Ok(()),
        });
        assert_eq!(machine.phase(), ConnectionPhase::Initializing);
        assert!(machine.timers().is_armed(TimerKind::Reconnect));

        // The pending reconnect owns the next connect.
        assert!(
            machine
                .handle(Event::TimerFired(TimerKind::CommandSettle))
                .is_empty()
        );

        let fx = machine.handle(Event::TimerFired(TimerKind::Reconnect));
        assert!(fx.contains(&Effect::Connect));
        assert_eq!(machine.phase(), ConnectionPhase::Connecting);

        let fx = machine.handle(Event::TransportOpened);
        assert_eq!(machine.phase(), ConnectionPhase::Connected);
        assert_eq!(machine.state().connection_attempts, 0);
        assert!(fx.contains(&Effect::Send(OutboundKind::RequestInitialState)));
    }

    #[test]
    fn refresh_in_qr_required_requests_and_fetches() {
        let mut machine = connected();
        machine.handle(initial_state(None, None));
        machine.handle(Event::TimerFired(TimerKind::SessionGrace));
        assert_eq!(
            machine.handle(Event::Refresh),
            vec![
                Effect::Send(OutboundKind::RequestInitialState),
                Effect::FetchQr
            ]
        );
    }

    #[test]
    fn destroy_cancels_everything_and_ignores_late_results() {
        let mut machine = connected();
        machine.handle(initial_state(None, None));
        machine.handle(Event::TimerFired(TimerKind::SessionGrace));

        let fx = machine.handle(Event::Destroy);
        assert!(fx.contains(&Effect::CloseTransport));
        assert!(machine.is_destroyed());
        assert_eq!(machine.timers().armed().count(), 0);

        assert!(
            machine
                .handle(Event::QrFetched(Some("late".to_owned())))
                .is_empty()
        );
        assert!(machine.handle(closed()).is_empty());
        assert!(machine.handle(Event::Retry).is_empty());
        assert!(machine.start().is_empty());
        assert_eq!(machine.state().qr_payload, None);
    }

    #[test]
    fn interleaved_events_keep_invariants() {
        let mut machine = connected();
        let script = vec![
            initial_state(None, Some("a")),
            qr_updated("b"),
            Event::TimerFired(TimerKind::SessionGrace),
            qr_updated("c"),
            Event::TimerFired(TimerKind::QrRefresh),
            closed(),
            Event::TimerFired(TimerKind::Reconnect),
            Event::TransportOpened,
            qr_updated("d"),
            Event::TimerFired(TimerKind::SessionGrace),
            client_ready(),
            qr_updated("e"),
            Event::Command(SessionCommand::Restart),
            Event::CommandCompleted {
                command: SessionCommand::Restart,
                outcome: Ok(()),
            },
            Event::TimerFired(TimerKind::CommandSettle),
            initial_state(Some(false), None),
            Event::TimerFired(TimerKind::SessionGrace),
            Event::QrFetched(Some("f".to_owned())),
            Event::Retry,
        ];
        for event in script {
            machine.handle(event);
            assert_consistent(&machine);
        }
    }
}
