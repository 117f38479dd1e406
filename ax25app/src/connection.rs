use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use ax25core::address::{Address, AddressField};
use ax25core::frame::{Ax25Frame, ControlField, Modulo, Pid, SupervisoryKind, UnnumberedKind};
use log::{debug, info, warn};

use crate::client::{ClientFrame, ClientId, ClientTx, PRIORITY_CONTROL, PRIORITY_DEFAULT, PRIORITY_URGENT};
use crate::error::Ax25Error;
use crate::observer::{DataObserver, UiObserver};
use crate::timer::{Timer, TimerResult, TimerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingConnection,
    AwaitingRelease,
    Connected,
    TimerRecovery,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Attempts before an unanswered frame takes the link down.
    pub retry_count: u32,
    /// Largest I-field carried in a single I-frame; longer payloads fragment.
    pub i_field_length: usize,
    /// T3: idle time before the link is polled with RR.
    pub keepalive: Duration,
    /// T1: how long an I-frame may stay unacknowledged.
    pub i_frame_timeout: Duration,
    /// Most unacknowledged I-frames in flight (modulo-8 window).
    pub window_size: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_count: 10,
            i_field_length: 2048,
            keepalive: Duration::from_secs(30),
            i_frame_timeout: Duration::from_secs(10),
            window_size: 4,
        }
    }
}

/// Identity of one link: both stations, the transport and the TNC port.
/// Used as the registry key, so the registry's hash of this tuple is the
/// stable connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    local: String,
    remote: String,
    client: ClientId,
    port: u8,
}

impl ConnectionId {
    pub fn new(local: &Address, remote: &Address, client: ClientId, port: u8) -> Self {
        Self {
            local: local.call_with_ssid(),
            remote: remote.call_with_ssid(),
            client,
            port,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}<->{}@{}:{}",
            self.local, self.remote, self.client, self.port
        )
    }
}

/// An I-frame awaiting acknowledgement.
struct Outstanding {
    frame: Ax25Frame,
    expires_at: Instant,
}

struct Inner {
    state: ConnectionState,
    local: Address,
    remote: Address,
    /// Numbering scheme committed at link setup; None until the first SABM.
    modulo: Option<Modulo>,
    /// V(S): next send sequence number.
    vs: u8,
    /// V(R): next expected inbound sequence number.
    vr: u8,
    /// V(A): oldest unacknowledged send sequence number.
    va: u8,
    peer_busy: bool,
    retries_remaining: u32,
    /// Payload fragments not yet assigned a sequence number.
    pending_info: VecDeque<Vec<u8>>,
    unacked: VecDeque<Outstanding>,
    ui_observers: Vec<Arc<dyn UiObserver>>,
    data_observers: Vec<Arc<dyn DataObserver>>,
    active: bool,
}

/// Observer work queued during a state transition and performed after the
/// connection lock is released.
enum Event {
    UiFrame(Ax25Frame),
    Data(Vec<u8>),
    Closed,
}

/// One AX.25 connection between a local and a remote station.
///
/// All state lives behind a single mutex; T1 and T3 run their callbacks on
/// timer threads and take the same lock, so every transition is serialised.
pub struct Connection {
    id: ConnectionId,
    client: ClientTx,
    client_id: ClientId,
    port: u8,
    config: ConnectionConfig,
    /// T1: outstanding-frame timer, also used to bound SABM/DISC handshakes.
    t1: Timer,
    /// T3: idle-link keepalive.
    t3: Timer,
    inner: Mutex<Inner>,
}

impl Connection {
    pub(crate) fn new(
        local: Address,
        remote: Address,
        client: ClientTx,
        client_id: ClientId,
        port: u8,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let i_frame_timeout = config.i_frame_timeout;
        let keepalive = config.keepalive;
        let retry_count = config.retry_count;
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let t1 = Timer::new(i_frame_timeout, {
                let connection = weak.clone();
                move |result| {
                    if result != TimerResult::Expired {
                        return;
                    }
                    if let Some(connection) = connection.upgrade() {
                        connection.t1_expired();
                    }
                }
            });
            let t3 = Timer::new(keepalive, {
                let connection = weak.clone();
                move |result| {
                    if result != TimerResult::Expired {
                        return;
                    }
                    if let Some(connection) = connection.upgrade() {
                        connection.t3_expired();
                    }
                }
            });
            let id = ConnectionId::new(&local, &remote, client_id, port);
            info!("connection initialised: {}", id);
            Connection {
                id,
                client,
                client_id,
                port,
                config,
                t1,
                t3,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    local,
                    remote,
                    modulo: None,
                    vs: 0,
                    vr: 0,
                    va: 0,
                    peer_busy: false,
                    retries_remaining: retry_count,
                    pending_info: VecDeque::new(),
                    unacked: VecDeque::new(),
                    ui_observers: Vec::new(),
                    data_observers: Vec::new(),
                    active: true,
                }),
            }
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// False once the connection has finished its release handshake or been
    /// aborted; the controller's sweep removes inactive connections.
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    pub fn add_ui_observer(&self, observer: Arc<dyn UiObserver>) {
        self.inner.lock().unwrap().ui_observers.push(observer);
    }

    pub fn add_data_observer(&self, observer: Arc<dyn DataObserver>) {
        self.inner.lock().unwrap().data_observers.push(observer);
    }

    /// Queue a payload for sequenced delivery, fragmenting as needed. Frames
    /// go out as the flow-control window allows.
    pub fn send_information(&self, payload: &[u8]) -> Result<(), Ax25Error> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(
            inner.state,
            ConnectionState::Connected | ConnectionState::TimerRecovery
        ) {
            return Err(Ax25Error::NotConnected);
        }
        for fragment in payload.chunks(self.config.i_field_length) {
            inner.pending_info.push_back(fragment.to_vec());
        }
        self.pump(&mut inner);
        Ok(())
    }

    /// Take the link down. A graceful stop performs the DISC handshake and
    /// waits in AWAITING_RELEASE; an abort sends one DISC at top priority and
    /// drops everything immediately.
    pub fn disconnect(&self, abort: bool) {
        let mut inner = self.inner.lock().unwrap();
        if abort {
            warn!("{}: abort requested", self.id);
            let frame = Ax25Frame::unnumbered(
                self.command_address(&inner),
                UnnumberedKind::Disconnect,
                true,
            );
            self.reset_state(&mut inner, false);
            self.queue(frame, PRIORITY_URGENT);
            inner.state = ConnectionState::Disconnected;
            inner.active = false;
            self.notify(inner, vec![Event::Closed]);
            return;
        }
        match inner.state {
            ConnectionState::AwaitingRelease => {}
            ConnectionState::Disconnected => {
                // Nothing to release.
                inner.active = false;
            }
            _ => {
                debug!("{}: stop requested", self.id);
                if self.t3.state() == TimerState::Running {
                    let _ = self.t3.stop();
                }
                let frame = Ax25Frame::unnumbered(
                    self.command_address(&inner),
                    UnnumberedKind::Disconnect,
                    true,
                );
                self.queue(frame, PRIORITY_CONTROL);
                inner.state = ConnectionState::AwaitingRelease;
                inner.retries_remaining = self.config.retry_count;
                // T1 bounds the release so an absent peer cannot wedge us.
                self.restart_t1();
            }
        }
    }

    /// Initiate the link from this side: send SABM and await the UA.
    pub(crate) fn connect(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.begin_establish(&mut inner);
    }

    /// Deliver one inbound frame. The controller has already matched it to
    /// this connection's identity.
    pub(crate) fn handle_frame(&self, frame: Ax25Frame) {
        let mut inner = self.inner.lock().unwrap();
        debug!("{}: handling frame {}", self.id, frame.address_field);
        if inner.state == ConnectionState::Connected {
            // Any traffic proves the link is alive.
            self.restart_t3();
        }
        let events = match inner.state {
            ConnectionState::Disconnected => self.disconnected_frame(&mut inner, frame),
            ConnectionState::AwaitingConnection => self.awaiting_connection_frame(&mut inner, frame),
            ConnectionState::AwaitingRelease => self.awaiting_release_frame(&mut inner, frame),
            ConnectionState::Connected | ConnectionState::TimerRecovery => {
                self.connected_frame(&mut inner, frame)
            }
        };
        self.notify(inner, events);
    }

    fn disconnected_frame(&self, inner: &mut Inner, frame: Ax25Frame) -> Vec<Event> {
        let mut events = Vec::new();
        match frame.control_field {
            ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                ..
            } => {
                debug!("{}: ignoring DM frame {}", self.id, frame.address_field);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final,
            } => {
                if poll_final {
                    self.queue(frame.dm_response(true), PRIORITY_CONTROL);
                }
                events.push(Event::UiFrame(frame));
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Disconnect,
                poll_final,
            } => {
                self.queue(frame.dm_response(poll_final), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabm,
                poll_final,
            } => {
                if inner.modulo == Some(Modulo::Mod128) {
                    self.queue(frame.dm_response(poll_final), PRIORITY_CONTROL);
                } else {
                    inner.modulo = Some(Modulo::Mod8);
                    inner.remote = frame.address_field.source.clone();
                    self.reset_state(inner, false);
                    self.queue(frame.ua_response(poll_final), PRIORITY_CONTROL);
                    self.enter_connected(inner);
                    info!("{}: link established by remote", self.id);
                }
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabme,
                poll_final,
            } => {
                // Extended (modulo-128) operation is not offered; decline so
                // the peer falls back to SABM.
                self.queue(frame.dm_response(poll_final), PRIORITY_CONTROL);
            }
            _ => {
                if frame.address_field.source.command_repeat_bit {
                    self.queue(
                        frame.dm_response(frame.control_field.poll_final()),
                        PRIORITY_CONTROL,
                    );
                } else {
                    debug!("{}: ignoring frame in disconnected state", self.id);
                }
            }
        }
        events
    }

    fn awaiting_connection_frame(&self, inner: &mut Inner, frame: Ax25Frame) -> Vec<Event> {
        let mut events = Vec::new();
        match frame.control_field {
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabm,
                poll_final,
            } => {
                self.queue(frame.ua_response(poll_final), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabme,
                poll_final,
            }
            | ControlField::Unnumbered {
                kind: UnnumberedKind::Disconnect,
                poll_final,
            } => {
                self.queue(frame.dm_response(poll_final), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final,
            } => {
                if poll_final {
                    self.queue(frame.dm_response(true), PRIORITY_CONTROL);
                }
                events.push(Event::UiFrame(frame));
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                poll_final: true,
            } => {
                info!("{}: connection refused by remote", self.id);
                self.reset_state(inner, false);
                inner.state = ConnectionState::Disconnected;
                inner.active = false;
                events.push(Event::Closed);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedAck,
                poll_final: true,
            } => {
                inner.remote = frame.address_field.source.clone();
                inner.modulo = Some(Modulo::Mod8);
                self.reset_state(inner, false);
                self.enter_connected(inner);
                info!("{}: link established", self.id);
            }
            _ => {
                debug!("{}: ignoring frame while awaiting connection", self.id);
            }
        }
        events
    }

    fn awaiting_release_frame(&self, inner: &mut Inner, frame: Ax25Frame) -> Vec<Event> {
        let mut events = Vec::new();
        match frame.control_field {
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabm | UnnumberedKind::Sabme,
                ..
            } => {
                self.queue(frame.dm_response(true), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Disconnect,
                poll_final,
            } => {
                self.queue(frame.ua_response(poll_final), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final,
            } => {
                if poll_final {
                    self.queue(frame.dm_response(true), PRIORITY_CONTROL);
                }
                events.push(Event::UiFrame(frame));
            }
            ControlField::Supervisory { poll_final, .. } => {
                if poll_final {
                    self.queue(frame.dm_response(true), PRIORITY_CONTROL);
                }
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedAck,
                poll_final: true,
            }
            | ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                poll_final: true,
            } => {
                info!("{}: link released", self.id);
                self.reset_state(inner, false);
                inner.state = ConnectionState::Disconnected;
                inner.active = false;
                events.push(Event::Closed);
            }
            _ => {
                debug!("{}: ignoring frame while awaiting release", self.id);
            }
        }
        events
    }

    /// Handler for both CONNECTED and TIMER_RECOVERY; the supervisory path
    /// additionally completes recovery when a final arrives.
    fn connected_frame(&self, inner: &mut Inner, frame: Ax25Frame) -> Vec<Event> {
        let mut events = Vec::new();
        match frame.control_field {
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                ..
            } => {
                events.push(Event::UiFrame(frame));
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Disconnect,
                poll_final,
            } => {
                info!("{}: link released by remote", self.id);
                self.queue(frame.ua_response(poll_final), PRIORITY_CONTROL);
                self.reset_state(inner, false);
                inner.state = ConnectionState::Disconnected;
                inner.active = false;
                events.push(Event::Closed);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabm,
                poll_final,
            } => {
                // Link reset in place. Keep unsent data if anything was still
                // outstanding; it goes out again under fresh sequence numbers.
                debug!("{}: link reset by remote", self.id);
                self.queue(frame.ua_response(poll_final), PRIORITY_CONTROL);
                let preserve = inner.vs != inner.va;
                self.reset_state(inner, preserve);
                inner.state = ConnectionState::Connected;
                self.restart_t3();
                self.pump(inner);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabme,
                poll_final,
            } => {
                self.queue(frame.dm_response(poll_final), PRIORITY_CONTROL);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedAck | UnnumberedKind::FrameReject,
                ..
            } => {
                warn!("{}: peer lost link sync, re-establishing", self.id);
                self.begin_establish(inner);
            }
            ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                ..
            } => {
                warn!("{}: link terminated by DM", self.id);
                self.reset_state(inner, false);
                inner.state = ConnectionState::Disconnected;
                inner.active = false;
                events.push(Event::Closed);
            }
            ControlField::Unnumbered { .. } => {
                debug!("{}: ignoring frame in connected state", self.id);
            }
            ControlField::Supervisory {
                kind,
                receive,
                poll_final,
            } => {
                self.supervisory_frame(inner, &frame, kind, receive, poll_final, &mut events);
            }
            ControlField::Information {
                sequence,
                receive,
                poll,
            } => {
                self.information_frame(inner, frame, sequence, receive, poll, &mut events);
            }
        }
        events
    }

    fn supervisory_frame(
        &self,
        inner: &mut Inner,
        frame: &Ax25Frame,
        kind: SupervisoryKind,
        receive: u8,
        poll_final: bool,
        events: &mut Vec<Event>,
    ) {
        match kind {
            SupervisoryKind::ReceiveReady => {
                inner.peer_busy = false;
                if !self.apply_ack(inner, receive, events) {
                    return;
                }
                if inner.state == ConnectionState::TimerRecovery && poll_final {
                    self.exit_timer_recovery(inner);
                } else if poll_final {
                    // The peer is polling us; answer with our current V(R).
                    let address = frame.address_field.response_field();
                    self.queue(
                        Ax25Frame::supervisory(
                            address,
                            SupervisoryKind::ReceiveReady,
                            inner.vr,
                            true,
                        ),
                        PRIORITY_CONTROL,
                    );
                }
                self.pump(inner);
            }
            SupervisoryKind::ReceiveNotReady => {
                inner.peer_busy = true;
                if !self.apply_ack(inner, receive, events) {
                    return;
                }
                if inner.state == ConnectionState::TimerRecovery && poll_final {
                    self.exit_timer_recovery(inner);
                }
            }
            SupervisoryKind::Reject => {
                if !self.apply_ack(inner, receive, events) {
                    return;
                }
                if inner.state == ConnectionState::TimerRecovery && poll_final {
                    self.exit_timer_recovery(inner);
                }
                self.retransmit_outstanding(inner);
            }
            SupervisoryKind::SelectiveReject => {
                debug!(
                    "{}: selective reject not supported, treating as plain ack",
                    self.id
                );
                let _ = self.apply_ack(inner, receive, events);
            }
        }
    }

    fn information_frame(
        &self,
        inner: &mut Inner,
        frame: Ax25Frame,
        sequence: u8,
        receive: u8,
        poll: bool,
        events: &mut Vec<Event>,
    ) {
        if !self.apply_ack(inner, receive, events) {
            return;
        }
        let address = frame.address_field.response_field();
        if sequence == inner.vr {
            inner.vr = (inner.vr + 1) & 7;
            if !inner.peer_busy {
                self.queue(
                    Ax25Frame::supervisory(address, SupervisoryKind::ReceiveReady, inner.vr, poll),
                    PRIORITY_CONTROL,
                );
            }
            events.push(Event::Data(frame.information));
        } else {
            debug!(
                "{}: I-frame N(S) {} does not match V(R) {}, rejecting",
                self.id, sequence, inner.vr
            );
            self.queue(
                Ax25Frame::supervisory(address, SupervisoryKind::Reject, inner.vr, poll),
                PRIORITY_CONTROL,
            );
        }
        self.pump(inner);
    }

    /// Acknowledge everything below N(R). Returns false when N(R) falls
    /// outside [V(A), V(S)], which resets the link.
    fn apply_ack(&self, inner: &mut Inner, nr: u8, events: &mut Vec<Event>) -> bool {
        let outstanding = inner.vs.wrapping_sub(inner.va) & 7;
        let delta = nr.wrapping_sub(inner.va) & 7;
        if delta > outstanding {
            warn!(
                "{}: N(R) {} outside window [V(A) {}, V(S) {}]",
                self.id, nr, inner.va, inner.vs
            );
            self.fail_link(inner, events);
            return false;
        }
        if delta > 0 {
            let drained = (delta as usize).min(inner.unacked.len());
            inner.unacked.drain(..drained);
            inner.va = nr;
            inner.retries_remaining = self.config.retry_count;
        }
        if inner.unacked.is_empty() {
            if self.t1.state() == TimerState::Running {
                let _ = self.t1.stop();
            }
        } else if delta > 0 {
            self.restart_t1();
        }
        true
    }

    /// Send queued I-frames while the window has room and the peer will take
    /// them.
    fn pump(&self, inner: &mut Inner) {
        if inner.state != ConnectionState::Connected {
            return;
        }
        while !inner.peer_busy
            && (inner.vs.wrapping_sub(inner.va) & 7) < self.config.window_size
        {
            let Some(payload) = inner.pending_info.pop_front() else {
                break;
            };
            let frame = Ax25Frame::information(
                self.command_address(inner),
                inner.vs,
                inner.vr,
                false,
                Pid::NoLayer3,
                payload,
            );
            inner.unacked.push_back(Outstanding {
                frame: frame.clone(),
                expires_at: Instant::now() + self.config.i_frame_timeout,
            });
            self.queue(frame, PRIORITY_DEFAULT);
            inner.vs = (inner.vs + 1) & 7;
            self.restart_t1();
        }
    }

    fn retransmit_outstanding(&self, inner: &mut Inner) {
        let now = Instant::now();
        let mut frames = Vec::with_capacity(inner.unacked.len());
        for outstanding in inner.unacked.iter_mut() {
            outstanding.expires_at = now + self.config.i_frame_timeout;
            frames.push(outstanding.frame.clone());
        }
        for frame in frames {
            self.queue(frame, PRIORITY_DEFAULT);
        }
        if !inner.unacked.is_empty() {
            self.restart_t1();
        }
    }

    fn begin_establish(&self, inner: &mut Inner) {
        self.reset_state(inner, false);
        inner.state = ConnectionState::AwaitingConnection;
        let frame =
            Ax25Frame::unnumbered(self.command_address(inner), UnnumberedKind::Sabm, true);
        self.queue(frame, PRIORITY_CONTROL);
        self.restart_t1();
    }

    fn enter_connected(&self, inner: &mut Inner) {
        inner.state = ConnectionState::Connected;
        inner.retries_remaining = self.config.retry_count;
        self.restart_t3();
    }

    fn exit_timer_recovery(&self, inner: &mut Inner) {
        debug!("{}: peer answered poll, recovery complete", self.id);
        inner.state = ConnectionState::Connected;
        inner.retries_remaining = self.config.retry_count;
        if self.t1.state() == TimerState::Running {
            let _ = self.t1.stop();
        }
        if !inner.unacked.is_empty() {
            self.restart_t1();
        }
        self.restart_t3();
    }

    /// Retries exhausted or an unrecoverable protocol violation: tell the
    /// peer with DM and take the link down.
    fn fail_link(&self, inner: &mut Inner, events: &mut Vec<Event>) {
        warn!("{}: closing link", self.id);
        self.queue(
            Ax25Frame::unnumbered(
                self.response_address(inner),
                UnnumberedKind::DisconnectedMode,
                true,
            ),
            PRIORITY_CONTROL,
        );
        self.reset_state(inner, false);
        inner.state = ConnectionState::Disconnected;
        inner.active = false;
        events.push(Event::Closed);
    }

    fn t1_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut events = Vec::new();
        match inner.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => {
                if inner.retries_remaining == 0 {
                    warn!("{}: I-frame retries exhausted", self.id);
                    self.fail_link(&mut inner, &mut events);
                } else {
                    inner.retries_remaining -= 1;
                    let now = Instant::now();
                    let oldest = inner.unacked.front_mut().map(|outstanding| {
                        let overdue = now.saturating_duration_since(outstanding.expires_at);
                        outstanding.expires_at = now + self.config.i_frame_timeout;
                        (outstanding.frame.clone(), overdue)
                    });
                    if let Some((frame, overdue)) = oldest {
                        debug!(
                            "{}: oldest I-frame {}ms overdue, retransmitting ({} retries left)",
                            self.id,
                            overdue.as_millis(),
                            inner.retries_remaining
                        );
                        self.queue(frame, PRIORITY_DEFAULT);
                        self.restart_t1();
                    }
                }
            }
            ConnectionState::TimerRecovery => {
                if inner.retries_remaining == 0 {
                    warn!("{}: peer never answered poll", self.id);
                    self.fail_link(&mut inner, &mut events);
                } else {
                    inner.retries_remaining -= 1;
                    let frame = Ax25Frame::supervisory(
                        self.command_address(&inner),
                        SupervisoryKind::ReceiveReady,
                        inner.vr,
                        true,
                    );
                    self.queue(frame, PRIORITY_CONTROL);
                    self.restart_t1();
                }
            }
            ConnectionState::AwaitingConnection => {
                if inner.retries_remaining == 0 {
                    warn!("{}: connection attempt timed out", self.id);
                    self.fail_link(&mut inner, &mut events);
                } else {
                    inner.retries_remaining -= 1;
                    let frame = Ax25Frame::unnumbered(
                        self.command_address(&inner),
                        UnnumberedKind::Sabm,
                        true,
                    );
                    self.queue(frame, PRIORITY_CONTROL);
                    self.restart_t1();
                }
            }
            ConnectionState::AwaitingRelease => {
                if inner.retries_remaining == 0 {
                    warn!("{}: release never answered, forcing disconnect", self.id);
                    self.reset_state(&mut inner, false);
                    inner.state = ConnectionState::Disconnected;
                    inner.active = false;
                    events.push(Event::Closed);
                } else {
                    inner.retries_remaining -= 1;
                    let frame = Ax25Frame::unnumbered(
                        self.command_address(&inner),
                        UnnumberedKind::Disconnect,
                        true,
                    );
                    self.queue(frame, PRIORITY_CONTROL);
                    self.restart_t1();
                }
            }
        }
        self.notify(inner, events);
    }

    fn t3_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Connected {
            return;
        }
        debug!("{}: keepalive expired, polling peer", self.id);
        inner.state = ConnectionState::TimerRecovery;
        inner.retries_remaining = self.config.retry_count;
        let frame = Ax25Frame::supervisory(
            self.command_address(&inner),
            SupervisoryKind::ReceiveReady,
            inner.vr,
            true,
        );
        self.queue(frame, PRIORITY_CONTROL);
        self.restart_t1();
    }

    /// Clear sequence state and stop both timers. With `preserve_queue`,
    /// unacknowledged payloads return to the pending queue so they can be
    /// resent under fresh sequence numbers.
    fn reset_state(&self, inner: &mut Inner, preserve_queue: bool) {
        if self.t1.state() == TimerState::Running {
            let _ = self.t1.stop();
        }
        if self.t3.state() == TimerState::Running {
            let _ = self.t3.stop();
        }
        if preserve_queue {
            let requeued: Vec<Vec<u8>> = inner
                .unacked
                .drain(..)
                .map(|outstanding| outstanding.frame.information)
                .collect();
            for payload in requeued.into_iter().rev() {
                inner.pending_info.push_front(payload);
            }
        } else {
            inner.pending_info.clear();
            inner.unacked.clear();
        }
        inner.vs = 0;
        inner.vr = 0;
        inner.va = 0;
        inner.peer_busy = false;
        inner.retries_remaining = self.config.retry_count;
        debug!("{}: connection state reset", self.id);
    }

    fn restart_t1(&self) {
        if self.t1.state() == TimerState::Running {
            let _ = self.t1.stop();
        }
        let _ = self.t1.start();
    }

    fn restart_t3(&self) {
        if self.t3.state() == TimerState::Running {
            let _ = self.t3.stop();
        }
        let _ = self.t3.start();
    }

    /// Address field for frames this station originates as commands.
    fn command_address(&self, inner: &Inner) -> AddressField {
        let mut destination = inner.remote.clone();
        destination.command_repeat_bit = true;
        let mut source = inner.local.clone();
        source.command_repeat_bit = false;
        AddressField::new(destination, source)
    }

    /// Address field for responses not tied to a specific inbound frame.
    fn response_address(&self, inner: &Inner) -> AddressField {
        let mut destination = inner.remote.clone();
        destination.command_repeat_bit = false;
        let mut source = inner.local.clone();
        source.command_repeat_bit = true;
        AddressField::new(destination, source)
    }

    fn queue(&self, frame: Ax25Frame, priority: u8) {
        self.client.queue_frame(ClientFrame {
            frame,
            port: self.port,
            priority,
        });
    }

    fn notify(&self, inner: MutexGuard<'_, Inner>, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let ui_observers = inner.ui_observers.clone();
        let data_observers = inner.data_observers.clone();
        drop(inner);
        for event in events {
            match event {
                Event::UiFrame(frame) => {
                    for observer in &ui_observers {
                        observer.ui_frame_received(&frame, self.client_id, self.port);
                    }
                }
                Event::Data(data) => {
                    for observer in &data_observers {
                        observer.data_received(&data);
                    }
                }
                Event::Closed => {
                    for observer in &data_observers {
                        observer.disconnected();
                    }
                }
            }
        }
    }
}
