use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use ax25core::address::{Address, AddressField};
use ax25core::frame::{Ax25Frame, ControlField, Pid, UnnumberedKind};
use log::{debug, info, warn};

use crate::client::{Ax25Client, ClientFrame, ClientId, ClientTx, FrameRouter, PRIORITY_CONTROL};
use crate::connection::{Connection, ConnectionConfig, ConnectionId, ConnectionState};
use crate::error::Ax25Error;
use crate::observer::{ConnectionAcceptor, UiObserver};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between registry sweeps in normal operation.
    pub poll_sweep: Duration,
    /// Interval between sweeps once a graceful shutdown has been requested.
    pub shutdown_sweep: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_sweep: Duration::from_millis(100),
            shutdown_sweep: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

struct Listener {
    callsign: String,
    acceptor: Arc<dyn ConnectionAcceptor>,
}

struct ClientEntry {
    client: Arc<Ax25Client>,
}

struct Shared {
    config: ControllerConfig,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    listeners: Mutex<Vec<Listener>>,
    clients: Mutex<Vec<ClientEntry>>,
    ui_observers: RwLock<Vec<Arc<dyn UiObserver>>>,
    started: AtomicBool,
    shutdown_requested: AtomicBool,
    active: AtomicBool,
}

/// Routes inbound frames to connections, listeners and UI observers, and
/// owns every connection's lifecycle.
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connections: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                clients: Mutex::new(Vec::new()),
                ui_observers: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Accept inbound connections addressed to `callsign`.
    pub fn add_listener(
        &self,
        callsign: &str,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Result<(), Ax25Error> {
        let callsign = Address::from_callsign(callsign)?.call_with_ssid();
        let mut listeners = self.shared.listeners.lock().unwrap();
        if listeners.iter().any(|l| l.callsign == callsign) {
            return Err(Ax25Error::ListenerExists(callsign));
        }
        info!("adding listener for callsign {}", callsign);
        listeners.push(Listener { callsign, acceptor });
        Ok(())
    }

    pub fn remove_listener(&self, callsign: &str) {
        let Ok(address) = Address::from_callsign(callsign) else {
            return;
        };
        let callsign = address.call_with_ssid();
        info!("removing listener for {}", callsign);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .retain(|l| l.callsign != callsign);
    }

    /// Register a transport. Its reader and writer threads spawn when the
    /// controller starts, or immediately if it already has.
    pub fn add_client(&self, client: Ax25Client) -> ClientId {
        let client = Arc::new(client);
        let id = client.id();
        if self.shared.started.load(Ordering::Acquire) {
            client.start(self.router());
        }
        self.shared
            .clients
            .lock()
            .unwrap()
            .push(ClientEntry { client });
        id
    }

    pub fn add_ui_observer(&self, observer: Arc<dyn UiObserver>) {
        self.shared.ui_observers.write().unwrap().push(observer);
    }

    /// Connectionless send: a UI frame with the given digipeater path.
    #[allow(clippy::too_many_arguments)]
    pub fn send_ui_frame(
        &self,
        local: &str,
        remote: &str,
        payload: &[u8],
        client: ClientId,
        port: u8,
        priority: u8,
        path: &[&str],
        poll: bool,
    ) -> Result<(), Ax25Error> {
        let source = Address::from_callsign(local)?;
        let destination = Address::from_callsign(remote)?;
        let mut send_path = Vec::with_capacity(path.len());
        for call in path {
            send_path.push(Address::from_callsign(call)?);
        }
        let address_field = AddressField::with_path(destination, source, send_path)?;
        let frame = Ax25Frame::unnumbered_information(address_field, Pid::None, poll, payload.to_vec());
        let tx = self
            .shared
            .client_tx(client)
            .ok_or(Ax25Error::UnknownClient(client))?;
        debug!("sending UI frame {} via {}:{}", frame.address_field, client, port);
        tx.queue_frame(ClientFrame::new(frame, port, priority)?);
        Ok(())
    }

    /// Initiate a connection to a remote station. Returns the existing
    /// connection if one is already registered for the tuple.
    pub fn open_connection(
        &self,
        local: &str,
        remote: &str,
        client: ClientId,
        port: u8,
    ) -> Result<Arc<Connection>, Ax25Error> {
        let local = Address::from_callsign(local)?;
        let remote = Address::from_callsign(remote)?;
        let tx = self
            .shared
            .client_tx(client)
            .ok_or(Ax25Error::UnknownClient(client))?;
        let id = ConnectionId::new(&local, &remote, client, port);
        let mut connections = self.shared.connections.lock().unwrap();
        if let Some(existing) = connections.get(&id) {
            return Ok(existing.clone());
        }
        let connection = Connection::new(
            local,
            remote,
            tx,
            client,
            port,
            self.shared.config.connection.clone(),
        );
        connection.connect();
        connections.insert(id, connection.clone());
        Ok(connection)
    }

    /// Start every registered client and the registry sweep.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("controller starting");
        let router = self.router();
        for entry in self.shared.clients.lock().unwrap().iter() {
            entry.client.start(router.clone());
        }
        let shared = self.shared.clone();
        thread::spawn(move || sweep_loop(shared));
    }

    /// Shut down. A graceful stop releases every connection and terminates
    /// once the registry empties; an abort tears everything down at once.
    pub fn stop(&self, abort: bool) {
        if abort {
            warn!("abort requested, aborting all connections");
            let connections: Vec<_> = self
                .shared
                .connections
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for connection in connections {
                connection.disconnect(true);
            }
            self.shared.active.store(false, Ordering::Release);
            for entry in self.shared.clients.lock().unwrap().iter() {
                entry.client.stop();
            }
        } else {
            info!("stop requested, beginning graceful shutdown");
            self.shared.shutdown_requested.store(true, Ordering::Release);
        }
    }

    /// False once shutdown has completed.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    fn router(&self) -> FrameRouter {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |frame, client, port| {
            if let Some(shared) = shared.upgrade() {
                shared.route_frame(frame, client, port);
            }
        })
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl Shared {
    /// Routing policy for one inbound frame: existing connection first, then
    /// connectionless UI delivery, then listener match, else drop.
    fn route_frame(&self, frame: Ax25Frame, client: ClientId, port: u8) {
        debug!("got frame {}", frame.address_field);
        let id = ConnectionId::new(
            &frame.address_field.destination,
            &frame.address_field.source,
            client,
            port,
        );
        let existing = self.connections.lock().unwrap().get(&id).cloned();
        if let Some(connection) = existing {
            debug!("delivering frame to existing connection {}", connection.id());
            connection.handle_frame(frame);
            return;
        }
        if let ControlField::Unnumbered {
            kind: UnnumberedKind::UnnumberedInfo,
            poll_final,
        } = frame.control_field
        {
            if poll_final {
                if let Some(tx) = self.client_tx(client) {
                    tx.queue_frame(ClientFrame {
                        frame: frame.dm_response(true),
                        port,
                        priority: PRIORITY_CONTROL,
                    });
                }
            }
            let observers: Vec<_> = self.ui_observers.read().unwrap().clone();
            for observer in &observers {
                observer.ui_frame_received(&frame, client, port);
            }
            return;
        }
        let local_call = frame.address_field.destination.call_with_ssid();
        let acceptor = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.callsign == local_call)
            .map(|l| l.acceptor.clone());
        if let Some(acceptor) = acceptor {
            let Some(tx) = self.client_tx(client) else {
                return;
            };
            let connection = Connection::new(
                frame.address_field.destination.clone(),
                frame.address_field.source.clone(),
                tx,
                client,
                port,
                self.config.connection.clone(),
            );
            debug!(
                "delivering frame {} to new connection {}",
                frame.address_field,
                connection.id()
            );
            connection.handle_frame(frame);
            self.connections
                .lock()
                .unwrap()
                .insert(connection.id().clone(), connection.clone());
            acceptor.connection_accepted(connection);
        } else {
            debug!("ignoring frame {}", frame.address_field);
        }
    }

    fn client_tx(&self, id: ClientId) -> Option<ClientTx> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.client.id() == id)
            .map(|entry| entry.client.tx())
    }
}

fn sweep_loop(shared: Arc<Shared>) {
    loop {
        if !shared.active.load(Ordering::Acquire) {
            break;
        }
        let shutting_down = shared.shutdown_requested.load(Ordering::Acquire);
        let mut done = false;
        {
            let mut connections = shared.connections.lock().unwrap();
            connections.retain(|id, connection| {
                if connection.is_active() {
                    true
                } else {
                    debug!("destroying inactive connection {}", id);
                    false
                }
            });
            if shutting_down {
                for connection in connections.values() {
                    if connection.state() != ConnectionState::AwaitingRelease {
                        debug!(
                            "requesting graceful shutdown of connection {}",
                            connection.id()
                        );
                        connection.disconnect(false);
                    }
                }
                if connections.is_empty() {
                    info!("graceful shutdown complete");
                    done = true;
                }
            }
        }
        if done {
            break;
        }
        thread::sleep(if shutting_down {
            shared.config.shutdown_sweep
        } else {
            shared.config.poll_sweep
        });
    }
    shared.active.store(false, Ordering::Release);
    for entry in shared.clients.lock().unwrap().iter() {
        entry.client.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockTnc, NullTnc};
    use ax25core::frame::{Modulo, SupervisoryKind};
    use std::time::Instant;

    #[derive(Default)]
    struct CaptureAcceptor(Mutex<Vec<Arc<Connection>>>);

    impl ConnectionAcceptor for CaptureAcceptor {
        fn connection_accepted(&self, connection: Arc<Connection>) {
            self.0.lock().unwrap().push(connection);
        }
    }

    #[derive(Default)]
    struct CaptureUi(Mutex<Vec<Ax25Frame>>);

    impl UiObserver for CaptureUi {
        fn ui_frame_received(&self, frame: &Ax25Frame, _client: ClientId, _port: u8) {
            self.0.lock().unwrap().push(frame.clone());
        }
    }

    fn quick_config() -> ControllerConfig {
        ControllerConfig {
            poll_sweep: Duration::from_millis(10),
            shutdown_sweep: Duration::from_millis(15),
            connection: ConnectionConfig {
                retry_count: 1,
                i_frame_timeout: Duration::from_millis(20),
                ..ConnectionConfig::default()
            },
        }
    }

    fn address_to(dest: &str, source: &str) -> AddressField {
        AddressField::new(
            Address::from_callsign(dest).unwrap(),
            Address::from_callsign(source).unwrap(),
        )
    }

    fn sabm_to(dest: &str, source: &str) -> Ax25Frame {
        Ax25Frame::unnumbered(address_to(dest, source), UnnumberedKind::Sabm, false)
    }

    fn ui_to(dest: &str, source: &str, poll: bool) -> Ax25Frame {
        Ax25Frame::unnumbered_information(address_to(dest, source), Pid::None, poll, b"ui".to_vec())
    }

    #[test]
    fn listener_accepts_new_connection() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();

        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "NOCALL-15"), client, 0);

        let accepted = acceptor.0.lock().unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].state(), ConnectionState::Connected);
        assert_eq!(accepted[0].id().remote(), "NOCALL-15");
        let sent = controller.shared.client_tx(client).unwrap().drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].frame.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedAck,
                poll_final: false,
            }
        ));
    }

    #[test]
    fn frames_routed_to_existing_connection() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "NOCALL-15"), client, 0);
        controller.shared.client_tx(client).unwrap().drain();

        let iframe = Ax25Frame::information(
            address_to("K0JLB-9", "NOCALL-15"),
            0,
            0,
            false,
            Pid::NoLayer3,
            b"hello".to_vec(),
        );
        controller.shared.route_frame(iframe, client, 0);

        // Still exactly one connection, and it accepted the frame.
        assert_eq!(controller.shared.connections.lock().unwrap().len(), 1);
        let sent = controller.shared.client_tx(client).unwrap().drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].frame.control_field,
            ControlField::Supervisory {
                kind: SupervisoryKind::ReceiveReady,
                receive: 1,
                ..
            }
        ));
    }

    #[test]
    fn ui_frames_go_to_observers() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        let observer = Arc::new(CaptureUi::default());
        controller.add_ui_observer(observer.clone());

        controller
            .shared
            .route_frame(ui_to("ANYONE", "NOCALL-15", false), client, 0);
        assert_eq!(observer.0.lock().unwrap().len(), 1);
        assert!(controller.shared.client_tx(client).unwrap().drain().is_empty());

        // A polled UI frame with no matching connection draws a DM.
        controller
            .shared
            .route_frame(ui_to("ANYONE", "NOCALL-15", true), client, 0);
        assert_eq!(observer.0.lock().unwrap().len(), 2);
        let sent = controller.shared.client_tx(client).unwrap().drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].frame.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                poll_final: true,
            }
        ));
        assert!(controller.shared.connections.lock().unwrap().is_empty());
    }

    #[test]
    fn unmatched_frames_dropped() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        controller
            .shared
            .route_frame(sabm_to("W0UPS-1", "NOCALL-15"), client, 0);
        assert!(controller.shared.connections.lock().unwrap().is_empty());
        assert!(controller.shared.client_tx(client).unwrap().drain().is_empty());
    }

    #[test]
    fn duplicate_listener_rejected() {
        let controller = Controller::default();
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        assert!(matches!(
            controller.add_listener("K0JLB-9", acceptor.clone()),
            Err(Ax25Error::ListenerExists(_))
        ));
        // A different SSID is a different identity.
        controller.add_listener("K0JLB-1", acceptor).unwrap();
    }

    #[test]
    fn removed_listener_no_longer_accepts() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        controller.remove_listener("K0JLB-9");
        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "NOCALL-15"), client, 0);
        assert!(acceptor.0.lock().unwrap().is_empty());
    }

    #[test]
    fn send_ui_frame_builds_ui() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        controller
            .send_ui_frame(
                "K0JLB-9",
                "NOCALL-15",
                b"beacon",
                client,
                3,
                7,
                &["WIDE1-1", "WIDE2-2"],
                true,
            )
            .unwrap();
        let sent = controller.shared.client_tx(client).unwrap().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].port, 3);
        assert_eq!(sent[0].priority, 7);
        let frame = &sent[0].frame;
        assert!(matches!(
            frame.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final: true,
            }
        ));
        assert_eq!(frame.pid, Some(Pid::None));
        assert_eq!(frame.information, b"beacon".to_vec());
        assert_eq!(frame.address_field.source.call_with_ssid(), "K0JLB-9");
        assert_eq!(frame.address_field.destination.call_with_ssid(), "NOCALL-15");
        let path: Vec<String> = frame
            .address_field
            .path
            .iter()
            .map(|a| a.call_with_ssid())
            .collect();
        assert_eq!(path, vec!["WIDE1-1", "WIDE2-2"]);
        // And it round-trips on the wire.
        let decoded = Ax25Frame::decode(&frame.encode().unwrap(), Modulo::Mod8).unwrap();
        assert_eq!(&decoded, frame);
    }

    #[test]
    fn open_connection_sends_sabm() {
        let controller = Controller::default();
        let client = controller.add_client(Ax25Client::new(NullTnc).unwrap());
        let connection = controller
            .open_connection("K0JLB-9", "NOCALL-15", client, 0)
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::AwaitingConnection);
        let sent = controller.shared.client_tx(client).unwrap().drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].frame.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::Sabm,
                poll_final: true,
            }
        ));
        // Asking again returns the same connection.
        let again = controller
            .open_connection("K0JLB-9", "NOCALL-15", client, 0)
            .unwrap();
        assert!(Arc::ptr_eq(&connection, &again));
    }

    #[test]
    fn unknown_client_rejected() {
        let controller = Controller::default();
        let client = ClientId::next();
        assert!(matches!(
            controller.open_connection("K0JLB-9", "NOCALL-15", client, 0),
            Err(Ax25Error::UnknownClient(_))
        ));
    }

    #[test]
    fn reader_thread_decodes_and_routes() {
        let controller = Controller::new(quick_config());
        let tnc = MockTnc::new();
        controller.add_client(Ax25Client::new(tnc.clone()).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        controller.start();

        let sabm = sabm_to("K0JLB-9", "NOCALL-15");
        let kiss = ax25core::kiss::KissFrame::new(
            sabm.encode().unwrap(),
            ax25core::kiss::KissCommand::DataFrame,
            0,
        )
        .unwrap();
        tnc.feed(&kiss.encode());

        let deadline = Instant::now() + Duration::from_secs(3);
        while acceptor.0.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        {
            let accepted = acceptor.0.lock().unwrap();
            assert_eq!(accepted.len(), 1);
            assert_eq!(accepted[0].state(), ConnectionState::Connected);
        }

        // The UA answer makes it through the writer onto the wire.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut saw_ua = false;
        while !saw_ua && Instant::now() < deadline {
            if let Ok(frames) = ax25core::kiss::KissFrame::decode(&tnc.written()) {
                saw_ua = frames.iter().any(|kiss| {
                    matches!(
                        Ax25Frame::decode(&kiss.data, Modulo::Mod8),
                        Ok(Ax25Frame {
                            control_field: ControlField::Unnumbered {
                                kind: UnnumberedKind::UnnumberedAck,
                                poll_final: false,
                            },
                            ..
                        })
                    )
                });
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(saw_ua);
        controller.stop(true);
    }

    #[test]
    fn graceful_shutdown_releases_all_connections() {
        let controller = Controller::new(quick_config());
        let tnc = MockTnc::new();
        let client = controller.add_client(Ax25Client::new(tnc.clone()).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        controller.start();

        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "NOCALL-15"), client, 0);
        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "W0UPS-7"), client, 0);
        let connections: Vec<_> = acceptor.0.lock().unwrap().clone();
        assert_eq!(connections.len(), 2);
        assert!(connections
            .iter()
            .all(|c| c.state() == ConnectionState::Connected));
        assert!(controller.is_active());

        controller.stop(false);

        // Each connection sends DISC and enters AWAITING_RELEASE; the silent
        // peer never answers, so T1 runs the release down and the sweep
        // empties the registry, at which point the controller terminates.
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_active() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!controller.is_active());
        assert!(controller.shared.connections.lock().unwrap().is_empty());
        assert!(connections.iter().all(|c| !c.is_active()));

        // The wire saw one DISC with P=1 per connection.
        let written = tnc.written();
        let mut disc_targets = Vec::new();
        for kiss in ax25core::kiss::KissFrame::decode(&written).unwrap() {
            let frame = Ax25Frame::decode(&kiss.data, Modulo::Mod8).unwrap();
            if let ControlField::Unnumbered {
                kind: UnnumberedKind::Disconnect,
                poll_final,
            } = frame.control_field
            {
                assert!(poll_final);
                disc_targets.push(frame.address_field.destination.call_with_ssid());
            }
        }
        assert!(disc_targets.contains(&"NOCALL-15".to_string()));
        assert!(disc_targets.contains(&"W0UPS-7".to_string()));
    }

    #[test]
    fn abort_tears_down_immediately() {
        let controller = Controller::new(quick_config());
        let client = controller.add_client(Ax25Client::new(MockTnc::new()).unwrap());
        let acceptor = Arc::new(CaptureAcceptor::default());
        controller.add_listener("K0JLB-9", acceptor.clone()).unwrap();
        controller.start();
        controller
            .shared
            .route_frame(sabm_to("K0JLB-9", "NOCALL-15"), client, 0);

        controller.stop(true);
        assert!(!controller.is_active());
        let connections = acceptor.0.lock().unwrap();
        assert_eq!(connections[0].state(), ConnectionState::Disconnected);
        assert!(!connections[0].is_active());
    }
}
