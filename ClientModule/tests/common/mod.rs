//! Shared fixtures: a recording in-memory transport and a recording script runner.

#![allow(dead_code)]

use serde_json::{json, Value};
use spaces_client::error::TransportError;
use spaces_client::net::transport::{CompletionCallback, InterruptionHandler, InvokeCallback, MethodHandler, Transport};
use spaces_client::{ErrorCode, MultiplayerConfig, MultiplayerConnection, ScriptRunner};
use spaces_shared::constants::hub::*;
use spaces_shared::entity::SpaceEntityType;
use spaces_shared::{ReplicatedValue, Vector3};
use spaces_client::entity::{Component, ObjectMessage, ObjectPatch};
use spaces_shared::constants::keys::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory transport answering hub calls synchronously
pub struct MockTransport {
    client_id: u64,
    next_object_id: AtomicU64,
    invocations: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, MethodHandler>>,
    interruption: Mutex<Option<InterruptionHandler>>,
    failing: Mutex<HashSet<String>>,
    page_source: Mutex<Vec<Value>>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(client_id: u64) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            next_object_id: AtomicU64::new(1000),
            invocations: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            interruption: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            page_source: Mutex::new(Vec::new()),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    /// Make every call to `method` fail
    pub fn fail(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    /// Entities served by `PageScopedObjects`
    pub fn set_page_source(&self, entities: Vec<Value>) {
        *self.page_source.lock().unwrap() = entities;
    }

    /// Deliver an inbound hub call
    pub fn fire(&self, method: &str, args: Value) {
        let handler = self.handlers.lock().unwrap().get(method).cloned();
        match handler {
            Some(handler) => handler(args),
            None => panic!("no handler registered for {}", method),
        }
    }

    pub fn interrupt(&self, message: &str) {
        let handler = self.interruption.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(message.to_string());
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.invocations.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Every patch sent through `SendObjectPatches`, in order
    pub fn sent_patches(&self) -> Vec<ObjectPatch> {
        self.calls_to(SEND_OBJECT_PATCHES)
            .into_iter()
            .flat_map(|args| args[0].as_array().cloned().unwrap_or_default())
            .map(|p| ObjectPatch::from_json(p).unwrap())
            .collect()
    }

    pub fn clear_invocations(&self) {
        self.invocations.lock().unwrap().clear();
    }

    fn respond(&self, method: &str, args: &Value) -> Result<Value, TransportError> {
        if self.failing.lock().unwrap().contains(method) {
            return Err(TransportError::Remote(format!("{} rejected", method)));
        }

        match method {
            GENERATE_OBJECT_IDS => Ok(json!([self.next_object_id.fetch_add(1, Ordering::SeqCst)])),
            GET_CLIENT_ID => Ok(json!(self.client_id)),
            PAGE_SCOPED_OBJECTS => {
                let skip = args[2].as_u64().unwrap_or(0) as usize;
                let limit = args[3].as_u64().unwrap_or(100) as usize;
                let source = self.page_source.lock().unwrap();
                let items: Vec<Value> = source.iter().skip(skip).take(limit).cloned().collect();
                Ok(json!([items, source.len()]))
            }
            _ => Ok(Value::Null),
        }
    }
}

impl Transport for MockTransport {
    fn start(&self, callback: CompletionCallback) {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        callback(Ok(()));
    }

    fn stop(&self, callback: CompletionCallback) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        callback(Ok(()));
    }

    fn invoke(&self, method: &str, args: Value, callback: InvokeCallback) {
        self.invocations.lock().unwrap().push((method.to_string(), args.clone()));
        let response = self.respond(method, &args);
        callback(response);
    }

    fn on(&self, method: &str, handler: MethodHandler) {
        self.handlers.lock().unwrap().insert(method.to_string(), handler);
    }

    fn on_interrupted(&self, handler: InterruptionHandler) {
        *self.interruption.lock().unwrap() = Some(handler);
    }
}

/// Script runner recording every call
#[derive(Default)]
pub struct MockRunner {
    pub runs: Mutex<Vec<(i64, String)>>,
    pub binds: Mutex<Vec<i64>>,
    pub modules: Mutex<HashMap<String, String>>,
}

impl MockRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripts_run(&self) -> Vec<String> {
        self.runs.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl ScriptRunner for MockRunner {
    fn create_context(&self, _context_id: i64) -> bool {
        true
    }

    fn destroy_context(&self, _context_id: i64) -> bool {
        true
    }

    fn reset_context(&self, _context_id: i64) -> bool {
        true
    }

    fn bind_context(&self, context_id: i64) -> bool {
        self.binds.lock().unwrap().push(context_id);
        true
    }

    fn run_script(&self, context_id: i64, script: &str) -> Result<(), String> {
        self.runs.lock().unwrap().push((context_id, script.to_string()));
        Ok(())
    }

    fn set_module_source(&self, module_path: &str, source: &str) {
        self.modules.lock().unwrap().insert(module_path.to_string(), source.to_string());
    }

    fn clear_module_source(&self, module_path: &str) {
        self.modules.lock().unwrap().remove(module_path);
    }

    fn exists_in_context(&self, _context_id: i64, _object_name: &str) -> bool {
        false
    }
}

pub struct Fixture {
    pub transport: Arc<MockTransport>,
    pub runner: Arc<MockRunner>,
    pub connection: Arc<MultiplayerConnection>,
}

/// A connected client with the given id
pub fn connected(client_id: u64, config: MultiplayerConfig) -> Fixture {
    init_logging();
    let transport = MockTransport::new(client_id);
    let runner = MockRunner::new();
    let connection = MultiplayerConnection::new(transport.clone(), config, runner.clone());

    let code = Arc::new(Mutex::new(None));
    let sink = code.clone();
    connection.connect(Box::new(move |c| *sink.lock().unwrap() = Some(c)));
    assert_eq!(*code.lock().unwrap(), Some(ErrorCode::None));

    Fixture { transport, runner, connection }
}

/// Config with rate limiting off so every tick flushes
pub fn unthrottled() -> MultiplayerConfig {
    MultiplayerConfig { entity_patch_rate_limit_enabled: false, ..MultiplayerConfig::default() }
}

/// Snapshot of an entity owned by another client
pub fn remote_entity(id: u64, entity_type: SpaceEntityType, owner_id: u64, name: &str) -> ObjectMessage {
    ObjectMessage {
        id,
        entity_type,
        is_transferable: entity_type == SpaceEntityType::Object,
        is_persistent: entity_type == SpaceEntityType::Object,
        owner_id,
        parent_id: None,
        components: BTreeMap::new(),
        view: BTreeMap::from([
            (COMPONENT_KEY_VIEW_ENTITY_NAME, ReplicatedValue::from(name)),
            (COMPONENT_KEY_VIEW_POSITION, ReplicatedValue::from(Vector3::zero())),
        ]),
    }
}

pub fn with_component(mut message: ObjectMessage, component: Component) -> ObjectMessage {
    message.components.insert(component.get_id(), component);
    message
}

/// Deliver a snapshot as if another client created it
pub fn deliver(transport: &MockTransport, message: &ObjectMessage) {
    transport.fire(ON_OBJECT_MESSAGE, json!([message.to_json().unwrap()]));
}

pub fn deliver_patch(transport: &MockTransport, patch: &ObjectPatch) {
    transport.fire(ON_OBJECT_PATCH, json!([patch.to_json().unwrap()]));
}
