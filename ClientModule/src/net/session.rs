use serde_json::Value;
use spaces_shared::connection::ConnectionState;
use spaces_shared::types::ClientId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::transport::{InvokeCallback, Transport};
use crate::cancellation::CancellationToken;
use crate::config::MultiplayerConfig;
use crate::lock;

/// State of one multiplayer session, shared by every subsystem
pub(crate) struct Session {
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    client_id: AtomicU64,
    allow_self_messaging: AtomicBool,
    config: MultiplayerConfig,
    cancellation: Mutex<CancellationToken>,
}

impl Session {
    pub(crate) fn new(transport: Arc<dyn Transport>, config: MultiplayerConfig) -> Self {
        Self {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            client_id: AtomicU64::new(0),
            allow_self_messaging: AtomicBool::new(config.allow_self_messaging),
            config,
            cancellation: Mutex::new(CancellationToken::new()),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn invoke(&self, method: &str, args: Value, callback: InvokeCallback) {
        self.transport.invoke(method, args, callback);
    }

    pub(crate) fn config(&self) -> &MultiplayerConfig {
        &self.config
    }

    pub(crate) fn client_id(&self) -> ClientId {
        self.client_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_client_id(&self, client_id: ClientId) {
        self.client_id.store(client_id, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Move to `next` only if currently in one of `from`. Returns the previous state on success.
    pub(crate) fn transition(&self, from: &[ConnectionState], next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut state = lock(&self.state);
        let previous = *state;
        if from.contains(&previous) {
            *state = next;
            Ok(previous)
        } else {
            Err(previous)
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn allow_self_messaging(&self) -> bool {
        self.allow_self_messaging.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allow_self_messaging(&self, allow: bool) {
        self.allow_self_messaging.store(allow, Ordering::SeqCst);
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        lock(&self.cancellation).clone()
    }

    /// Fresh token for a new connection attempt
    pub(crate) fn renew_cancellation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.cancellation) = token.clone();
        token
    }

    pub(crate) fn cancel(&self) {
        lock(&self.cancellation).cancel();
    }
}
