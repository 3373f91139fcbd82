//! # Network Event Bus
//!
//! Named events carried over the hub's event channel. Each name maps to an ordered
//! list of handlers; inbound events reach every handler in registration order.

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spaces_shared::connection::ErrorCode;
use spaces_shared::constants::hub::SEND_EVENT_MESSAGE;
use spaces_shared::constants::network::ALL_CLIENTS_ID;
use spaces_shared::types::ClientId;
use spaces_shared::value::ReplicatedValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::session::Session;
use crate::lock;

/// Handler for a named network event
pub type NetworkEventHandler = Arc<dyn Fn(bool, &[ReplicatedValue]) + Send + Sync>;

/// Completion reporting an error code
pub type ErrorCodeCallback = Box<dyn FnOnce(ErrorCode) + Send>;

/// Event envelope on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_type: String,
    pub sender_client_id: ClientId,
    /// `None` broadcasts to every client
    pub recipient_client_id: Option<ClientId>,
    pub components: Vec<ReplicatedValue>,
}

pub struct NetworkEventBus {
    session: Arc<Session>,
    handlers: Mutex<HashMap<String, Vec<NetworkEventHandler>>>,
}

impl NetworkEventBus {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session, handlers: Mutex::new(HashMap::new()) }
    }

    /// Add a handler for `event_name` after any already registered
    pub fn listen_network_event(&self, event_name: &str, handler: NetworkEventHandler) {
        lock(&self.handlers).entry(event_name.to_string()).or_default().push(handler);
        debug!("Listening for network event: {}", event_name);
    }

    /// Remove every handler for `event_name`
    pub fn stop_listen_network_event(&self, event_name: &str) {
        if lock(&self.handlers).remove(event_name).is_none() {
            warn!("No handlers registered for network event: {}", event_name);
        }
    }

    pub fn send_network_event(&self, event_name: &str, args: &[ReplicatedValue], callback: ErrorCodeCallback) {
        self.send_network_event_to_client(event_name, args, ALL_CLIENTS_ID, callback);
    }

    pub fn send_network_event_to_client(
        &self,
        event_name: &str,
        args: &[ReplicatedValue],
        target_client_id: ClientId,
        callback: ErrorCodeCallback,
    ) {
        if !self.session.is_connected() {
            callback(ErrorCode::NotConnected);
            return;
        }

        let message = EventMessage {
            event_type: event_name.to_string(),
            sender_client_id: self.session.client_id(),
            recipient_client_id: (target_client_id != ALL_CLIENTS_ID).then_some(target_client_id),
            components: args.to_vec(),
        };

        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize network event {}: {}", event_name, e);
                callback(ErrorCode::Unknown);
                return;
            }
        };

        let event_name = event_name.to_string();
        self.session.invoke(
            SEND_EVENT_MESSAGE,
            Value::Array(vec![payload]),
            Box::new(move |result| match result {
                Ok(_) => callback(ErrorCode::None),
                Err(e) => {
                    error!("Failed to send network event {}: {}", event_name, e);
                    callback(e.error_code());
                }
            }),
        );
    }

    /// Handle an inbound `OnEventMessage` argument array
    pub(crate) fn on_event_message(&self, args: Value) {
        let raw = match args {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => {
                warn!("Ignoring malformed event message: {}", other);
                return;
            }
        };

        match serde_json::from_value::<EventMessage>(raw) {
            Ok(message) => self.dispatch(&message),
            Err(e) => warn!("Ignoring undecodable event message: {}", e),
        }
    }

    pub(crate) fn dispatch(&self, message: &EventMessage) {
        if message.sender_client_id == self.session.client_id() && !self.session.allow_self_messaging() {
            debug!("Dropping self-sent network event: {}", message.event_type);
            return;
        }

        let handlers = lock(&self.handlers).get(&message.event_type).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!("No handler for network event: {}", message.event_type);
        }
        for handler in handlers {
            handler(true, &message.components);
        }
    }
}
