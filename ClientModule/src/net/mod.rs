//! # Network Module
//!
//! Handles the session with the multiplayer backend: connection lifecycle,
//! scopes, self-messaging and the wiring of inbound hub calls to the event bus
//! and the entity system.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnecting ->
//! Disconnected`. An interruption goes straight to `Disconnected`.

pub mod event_bus;
pub(crate) mod session;
pub mod transport;

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use spaces_shared::connection::{ConnectionState, ErrorCode};
use spaces_shared::constants::entity::ALL_ENTITIES_ID;
use spaces_shared::constants::SPACES_CLIENT_VERSION;
use spaces_shared::constants::hub::*;
use spaces_shared::constants::network::DISCONNECT_REASON_CLIENT;
use spaces_shared::scope::Scope;
use spaces_shared::types::ClientId;
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use self::event_bus::{ErrorCodeCallback, NetworkEventBus};
use self::session::Session;
use self::transport::Transport;
use crate::cancellation::CancellationToken;
use crate::config::MultiplayerConfig;
use crate::entity::SpaceEntitySystem;
use crate::error::TransportError;
use crate::lock;
use crate::runtime;
use crate::script::ScriptRunner;
use crate::serialization::parse_u64;

/// Receives a status message or disconnect reason
pub type ConnectionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ConnectionCallbacks {
    connection: Option<ConnectionCallback>,
    disconnection: Option<ConnectionCallback>,
    network_interruption: Option<ConnectionCallback>,
}

pub struct MultiplayerConnection {
    session: Arc<Session>,
    event_bus: Arc<NetworkEventBus>,
    entity_system: Arc<SpaceEntitySystem>,
    callbacks: Mutex<ConnectionCallbacks>,
    self_ref: Weak<MultiplayerConnection>,
}

impl MultiplayerConnection {
    pub fn new(transport: Arc<dyn Transport>, config: MultiplayerConfig, runner: Arc<dyn ScriptRunner>) -> Arc<Self> {
        if let Err(e) = config.validate() {
            warn!("{}; zero values are raised to 1", e);
        }
        let session = Arc::new(Session::new(transport, config));
        let event_bus = Arc::new(NetworkEventBus::new(session.clone()));
        let entity_system = SpaceEntitySystem::new(session.clone(), event_bus.clone(), runner);

        let connection = Arc::new_cyclic(|self_ref| Self {
            session,
            event_bus,
            entity_system,
            callbacks: Mutex::new(ConnectionCallbacks::default()),
            self_ref: self_ref.clone(),
        });
        connection.bind_network_handlers();
        connection
    }

    fn bind_network_handlers(&self) {
        let transport = self.session.transport();

        let bus = Arc::downgrade(&self.event_bus);
        transport.on(
            ON_EVENT_MESSAGE,
            Arc::new(move |args| {
                if let Some(bus) = bus.upgrade() {
                    bus.on_event_message(args);
                }
            }),
        );

        let weak = self.self_ref.clone();
        transport.on(
            ON_REQUEST_TO_DISCONNECT,
            Arc::new(move |args| {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                let reason = match &args {
                    Value::Array(items) => items.first().and_then(Value::as_str).unwrap_or_default().to_string(),
                    _ => String::new(),
                };
                info!("Server requested disconnect: {}", reason);
                connection.disconnect_with_reason(&reason, Box::new(|_| {}));
            }),
        );

        let weak = self.self_ref.clone();
        transport.on_interrupted(Arc::new(move |message| {
            if let Some(connection) = weak.upgrade() {
                connection.on_interrupted(&message);
            }
        }));
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        lock(&self.callbacks).connection = Some(callback);
    }

    pub fn set_disconnection_callback(&self, callback: ConnectionCallback) {
        lock(&self.callbacks).disconnection = Some(callback);
    }

    pub fn set_network_interruption_callback(&self, callback: ConnectionCallback) {
        lock(&self.callbacks).network_interruption = Some(callback);
    }

    /// Start the transport and join the session. The callback fires exactly once.
    pub fn connect(&self, callback: ErrorCodeCallback) {
        if let Err(state) = self.session.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting) {
            warn!("connect called while {:?}", state);
            callback(ErrorCode::AlreadyConnected);
            return;
        }

        self.session.renew_cancellation();
        info!("Connecting to multiplayer service (client {})", SPACES_CLIENT_VERSION);

        let weak = self.self_ref.clone();
        self.session.transport().start(Box::new(move |result| {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => connection.delete_owned_entities(callback),
                Err(e) => connection.fail_connect(e, callback),
            }
        }));
    }

    fn delete_owned_entities(&self, callback: ErrorCodeCallback) {
        let weak = self.self_ref.clone();
        self.session.invoke(
            DELETE_OBJECTS,
            json!([[ALL_ENTITIES_ID]]),
            Box::new(move |result| {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(_) => connection.request_client_id(callback),
                    Err(e) => connection.fail_connect(e, callback),
                }
            }),
        );
    }

    fn request_client_id(&self, callback: ErrorCodeCallback) {
        let weak = self.self_ref.clone();
        self.session.invoke(
            GET_CLIENT_ID,
            json!([]),
            Box::new(move |result| {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                let client_id = match result {
                    Ok(value) => parse_u64(&value)
                        .ok_or_else(|| TransportError::Remote(format!("unexpected client id: {}", value))),
                    Err(e) => Err(e),
                };
                match client_id {
                    Ok(client_id) => {
                        connection.session.set_client_id(client_id);
                        debug!("Assigned client id {}", client_id);
                        connection.start_listening(callback);
                    }
                    Err(e) => connection.fail_connect(e, callback),
                }
            }),
        );
    }

    fn start_listening(&self, callback: ErrorCodeCallback) {
        let weak = self.self_ref.clone();
        self.session.invoke(
            START_LISTENING,
            json!([]),
            Box::new(move |result| {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(_) => connection.on_connected(callback),
                    Err(e) => connection.fail_connect(e, callback),
                }
            }),
        );
    }

    fn on_connected(&self, callback: ErrorCodeCallback) {
        if self
            .session
            .transition(&[ConnectionState::Connecting], ConnectionState::Connected)
            .is_err()
        {
            warn!("Connection was closed before the handshake finished");
            callback(ErrorCode::NotConnected);
            return;
        }

        self.entity_system.on_connect();
        info!("Connected with client id {}", self.session.client_id());

        let connection_callback = lock(&self.callbacks).connection.clone();
        if let Some(connection_callback) = connection_callback {
            connection_callback("Success");
        }
        callback(ErrorCode::None);
    }

    fn fail_connect(&self, error: TransportError, callback: ErrorCodeCallback) {
        error!("Failed to connect: {}", error);
        let code = match error.error_code() {
            ErrorCode::NotConnected => ErrorCode::Unknown,
            code => code,
        };
        self.disconnect_with_reason(&error.to_string(), Box::new(move |_| callback(code)));
    }

    /// End the session. `NotConnected` when there is nothing to end.
    pub fn disconnect(&self, callback: ErrorCodeCallback) {
        match self.session.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.disconnect_with_reason(DISCONNECT_REASON_CLIENT, callback)
            }
            _ => callback(ErrorCode::NotConnected),
        }
    }

    /// Stop the transport, clear the session, then report the code and the reason once each
    pub fn disconnect_with_reason(&self, reason: &str, callback: ErrorCodeCallback) {
        if self
            .session
            .transition(&[ConnectionState::Connected, ConnectionState::Connecting], ConnectionState::Disconnecting)
            .is_err()
        {
            callback(ErrorCode::NotConnected);
            return;
        }

        self.session.cancel();
        info!("Disconnecting: {}", reason);

        let weak = self.self_ref.clone();
        let reason = reason.to_string();
        self.session.transport().stop(Box::new(move |result| {
            let Some(connection) = weak.upgrade() else {
                return;
            };

            connection.session.set_state(ConnectionState::Disconnected);
            connection.entity_system.on_disconnect();

            let code = match result {
                Ok(()) => ErrorCode::None,
                Err(e) => {
                    error!("Transport failed to stop cleanly: {}", e);
                    e.error_code()
                }
            };
            callback(code);

            let disconnection_callback = lock(&connection.callbacks).disconnection.clone();
            if let Some(disconnection_callback) = disconnection_callback {
                disconnection_callback(&reason);
            }
        }));
    }

    fn on_interrupted(&self, message: &str) {
        let previous = self.session.state();
        if previous == ConnectionState::Disconnected {
            debug!("Ignoring interruption while disconnected: {}", message);
            return;
        }

        self.session.set_state(ConnectionState::Disconnected);
        self.session.cancel();
        self.entity_system.on_disconnect();
        error!("Connection interrupted: {}", message);

        let callback = lock(&self.callbacks).network_interruption.clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }

    /// Tell the server which scopes this client subscribes to
    pub fn set_scopes(&self, scopes: &[Scope], callback: ErrorCodeCallback) {
        let payload = match serde_json::to_value(scopes) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialise scopes: {}", e);
                callback(ErrorCode::Unknown);
                return;
            }
        };
        self.invoke_with_code(SET_SCOPES, json!([payload]), callback);
    }

    pub fn reset_scopes(&self, callback: ErrorCodeCallback) {
        self.invoke_with_code(RESET_SCOPES, json!([]), callback);
    }

    pub fn stop_listening(&self, callback: ErrorCodeCallback) {
        self.invoke_with_code(STOP_LISTENING, json!([]), callback);
    }

    pub fn set_allow_self_messaging(&self, allow: bool, callback: ErrorCodeCallback) {
        let session = self.session.clone();
        self.invoke_with_code(
            SET_ALLOW_SELF_MESSAGING,
            json!([allow]),
            Box::new(move |code| {
                if code == ErrorCode::None {
                    session.set_allow_self_messaging(allow);
                }
                callback(code);
            }),
        );
    }

    pub fn get_allow_self_messaging(&self) -> bool {
        self.session.allow_self_messaging()
    }

    fn invoke_with_code(&self, method: &'static str, args: Value, callback: ErrorCodeCallback) {
        if !self.session.is_connected() {
            callback(ErrorCode::NotConnected);
            return;
        }

        self.session.invoke(
            method,
            args,
            Box::new(move |result| match result {
                Ok(_) => callback(ErrorCode::None),
                Err(e) => {
                    error!("{} failed: {}", method, e);
                    callback(e.error_code());
                }
            }),
        );
    }

    pub fn get_client_id(&self) -> ClientId {
        self.session.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn space_entity_system(&self) -> &Arc<SpaceEntitySystem> {
        &self.entity_system
    }

    pub fn event_bus(&self) -> &Arc<NetworkEventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &MultiplayerConfig {
        self.session.config()
    }

    /// Token of the current connection; cancelled on disconnect or interruption
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancellation_token()
    }

    /// Tick the entity system at the configured interval until this connection ends
    pub fn spawn_tick_loop(&self, handle: &Handle) -> JoinHandle<()> {
        runtime::spawn_tick_loop(
            handle,
            self.entity_system.clone(),
            self.config().tick_interval(),
            self.cancellation_token(),
        )
    }
}
