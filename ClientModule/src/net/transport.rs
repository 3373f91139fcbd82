//! # Transport
//!
//! The persistent bidirectional connection to the backend hub is an external
//! capability. The client only needs named request/response calls, named inbound
//! handlers and an interruption signal.
//!
//! Implementations may call back from any thread. Every callback passed to
//! `start`, `stop` or `invoke` must be called exactly once.

use serde_json::Value;
use std::sync::Arc;

use crate::error::TransportError;

/// Completion of a hub call
pub type InvokeCallback = Box<dyn FnOnce(Result<Value, TransportError>) + Send>;

/// Completion of `start` or `stop`
pub type CompletionCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Inbound call from the hub; receives the argument array
pub type MethodHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Unexpected connection loss; receives a description
pub type InterruptionHandler = Arc<dyn Fn(String) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn start(&self, callback: CompletionCallback);

    fn stop(&self, callback: CompletionCallback);

    /// Call a hub method with a JSON argument array
    fn invoke(&self, method: &str, args: Value, callback: InvokeCallback);

    /// Register the handler for an inbound method, replacing any previous one
    fn on(&self, method: &str, handler: MethodHandler);

    fn on_interrupted(&self, handler: InterruptionHandler);
}
