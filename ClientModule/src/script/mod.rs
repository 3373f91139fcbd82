//! # Entity Scripts
//!
//! An `EntityScript` binds one entity's script source to the external scripting
//! runtime and routes property-change and message events into it. Failures are
//! recorded on the script and never propagated.
//!
//! The runtime is always called with no script lock held, so a running script
//! may call back into its own entity (for example to subscribe to messages).

pub mod runner;

pub use runner::{ScriptHost, ScriptRoute, ScriptRunner};

use crate::lock;
use log::{debug, error, trace};
use spaces_shared::constants::script::{ERROR_EMPTY_SCRIPT, ERROR_NO_COMPONENT, MSG_ENTITY_TICK};
use spaces_shared::constants::network::NO_CLIENT_ID;
use spaces_shared::entity::ScriptScope;
use spaces_shared::types::{ClientId, EntityId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Cached contents of an entity's script data component
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptComponentData {
    pub source: String,
    pub owner_id: ClientId,
    pub scope: ScriptScope,
}

#[derive(Default)]
struct ScriptState {
    module_name: String,
    component: Option<ScriptComponentData>,
    has_binding: bool,
    last_error: Option<String>,
}

#[derive(Default)]
struct Subscriptions {
    properties: HashMap<(u16, u32), String>,
    messages: HashMap<String, String>,
}

pub struct EntityScript {
    context_id: i64,
    runner: Arc<dyn ScriptRunner>,
    host: Weak<dyn ScriptHost>,
    state: Mutex<ScriptState>,
    subscriptions: Mutex<Subscriptions>,
}

impl EntityScript {
    pub fn new(entity_id: EntityId, module_name: &str, runner: Arc<dyn ScriptRunner>, host: Weak<dyn ScriptHost>) -> Self {
        Self {
            context_id: entity_id as i64,
            runner,
            host,
            state: Mutex::new(ScriptState {
                module_name: module_name.to_string(),
                ..Default::default()
            }),
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    fn module_name(&self) -> String {
        lock(&self.state).module_name.clone()
    }

    pub(crate) fn set_module_name(&self, name: &str) {
        lock(&self.state).module_name = name.to_string();
    }

    /// Attach, refresh or detach the cached script component.
    /// A newly attached component gets a runtime context.
    pub fn set_script_component(&self, data: Option<ScriptComponentData>) {
        let attached = {
            let mut state = lock(&self.state);
            let attached = state.component.is_none() && data.is_some();
            state.component = data;
            attached
        };
        if attached {
            self.runner.create_context(self.context_id);
        }
    }

    pub fn has_entity_script_component(&self) -> bool {
        lock(&self.state).component.is_some()
    }

    pub fn get_script_source(&self) -> String {
        lock(&self.state).component.as_ref().map(|c| c.source.clone()).unwrap_or_default()
    }

    pub fn set_script_source(&self, source: &str) {
        let created = {
            let mut state = lock(&self.state);
            trace!("EntityScript::set_script_source for {}:\n{}", state.module_name, source);
            match state.component.as_mut() {
                Some(component) => {
                    component.source = source.to_string();
                    false
                }
                None => {
                    state.component = Some(ScriptComponentData {
                        source: source.to_string(),
                        ..Default::default()
                    });
                    true
                }
            }
        };
        if created {
            self.runner.create_context(self.context_id);
        }
    }

    pub fn get_owner_id(&self) -> ClientId {
        lock(&self.state).component.as_ref().map(|c| c.owner_id).unwrap_or(NO_CLIENT_ID)
    }

    /// Returns true when the owner actually changed
    pub fn set_owner_id(&self, client_id: ClientId) -> bool {
        match lock(&self.state).component.as_mut() {
            Some(component) if component.owner_id != client_id => {
                component.owner_id = client_id;
                true
            }
            _ => false,
        }
    }

    pub fn scope(&self) -> ScriptScope {
        lock(&self.state).component.as_ref().map(|c| c.scope).unwrap_or_default()
    }

    /// Bind and run the whole script source. Returns false and records the error on failure.
    pub fn invoke(&self) -> bool {
        self.check_binding();

        let (module_name, source) = {
            let state = lock(&self.state);
            (state.module_name.clone(), state.component.as_ref().map(|c| c.source.clone()))
        };
        debug!("EntityScript::invoke called for {}", module_name);

        let result = match source {
            None => Err(ERROR_NO_COMPONENT.to_string()),
            Some(source) if source.is_empty() => Err(ERROR_EMPTY_SCRIPT.to_string()),
            Some(source) => self.runner.run_script(self.context_id, &source),
        };

        match result {
            Ok(()) => {
                lock(&self.state).last_error = None;
                true
            }
            Err(message) => {
                error!("Script Error: {}", message);
                lock(&self.state).last_error = Some(message);
                false
            }
        }
    }

    /// Run script text here or on the leader, as the host decides
    pub fn run_script(&self, source: &str) {
        let host = self.host.upgrade();
        let route = match host.as_ref() {
            Some(host) => host.route_script(self.get_owner_id(), self.scope()),
            None => ScriptRoute::Local,
        };

        match (route, host) {
            (ScriptRoute::Local, _) => {
                if let Err(message) = self.runner.run_script(self.context_id, source) {
                    let mut state = lock(&self.state);
                    error!("Script Error in {}: {}", state.module_name, message);
                    state.last_error = Some(message);
                }
            }
            (ScriptRoute::Leader, Some(host)) => host.run_script_remotely(self.context_id, source),
            (ScriptRoute::Leader, None) => {}
            (ScriptRoute::Skip, _) => {
                trace!("Skipping script run for {}; another client runs it", self.module_name());
            }
        }
    }

    pub fn has_error(&self) -> bool {
        lock(&self.state).last_error.is_some()
    }

    pub fn get_error_text(&self) -> String {
        lock(&self.state).last_error.clone().unwrap_or_default()
    }

    pub fn register_source_as_module(&self) {
        let module = {
            let state = lock(&self.state);
            state.component.as_ref().map(|c| (state.module_name.clone(), c.source.clone()))
        };
        if let Some((name, source)) = module {
            self.runner.set_module_source(&name, &source);
        }
    }

    pub fn bind(&self) {
        if !self.has_entity_script_component() {
            return;
        }
        self.runner.bind_context(self.context_id);
        lock(&self.state).has_binding = true;
    }

    pub fn check_binding(&self) {
        if !self.is_bound() {
            self.bind();
        }
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.state).has_binding
    }

    pub fn subscribe_to_property_change(&self, component_id: u16, property_key: u32, message: &str) {
        lock(&self.subscriptions)
            .properties
            .entry((component_id, property_key))
            .or_insert_with(|| {
                debug!("SubscribeToPropertyChange: ({}, {}) {}", component_id, property_key, message);
                message.to_string()
            });
    }

    /// Post the subscribed message, if any, for a changed property
    pub fn on_property_changed(&self, component_id: u16, property_key: u32) {
        let message = lock(&self.subscriptions).properties.get(&(component_id, property_key)).cloned();
        if let Some(message) = message {
            let params = serde_json::json!({ "id": component_id, "key": property_key }).to_string();
            self.post_message_to_script(&message, &params);
        }
    }

    pub fn subscribe_to_message(&self, message: &str, callback: &str) {
        lock(&self.subscriptions).messages.entry(message.to_string()).or_insert_with(|| {
            debug!("SubscribeToMessage: {} -> {}", message, callback);
            callback.to_string()
        });
    }

    pub fn post_message_to_script(&self, message: &str, params_json: &str) {
        let Some(callback) = lock(&self.subscriptions).messages.get(message).cloned() else {
            return;
        };

        let script_text = format!("{}('{}','{}')", callback, message, params_json);
        if message != MSG_ENTITY_TICK {
            debug!("PostMessageToScript: {}", script_text);
        }
        self.run_script(&script_text);
    }

    /// Replace the running source: subscriptions are dropped and the context is rebuilt
    pub fn on_source_changed(&self, source: &str) {
        debug!("OnSourceChanged: {}", source);

        let module_name = {
            let mut state = lock(&self.state);
            let Some(component) = state.component.as_mut() else {
                return;
            };
            component.source = source.to_string();
            state.has_binding = false;
            state.module_name.clone()
        };
        {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.messages.clear();
            subscriptions.properties.clear();
        }
        self.runner.reset_context(self.context_id);
        self.runner.set_module_source(&module_name, source);
        self.bind();
    }

    pub fn shutdown(&self) {
        self.runner.clear_module_source(&self.module_name());
        self.runner.destroy_context(self.context_id);
        lock(&self.state).has_binding = false;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<(i64, String)>>,
        modules: Mutex<HashMap<String, String>>,
        binds: Mutex<u32>,
        resets: Mutex<u32>,
        fail_with: Mutex<Option<String>>,
    }

    impl ScriptRunner for RecordingRunner {
        fn create_context(&self, _context_id: i64) -> bool {
            true
        }
        fn destroy_context(&self, _context_id: i64) -> bool {
            true
        }
        fn reset_context(&self, _context_id: i64) -> bool {
            *self.resets.lock().unwrap() += 1;
            true
        }
        fn bind_context(&self, _context_id: i64) -> bool {
            *self.binds.lock().unwrap() += 1;
            true
        }
        fn run_script(&self, context_id: i64, script: &str) -> Result<(), String> {
            self.runs.lock().unwrap().push((context_id, script.to_string()));
            match self.fail_with.lock().unwrap().clone() {
                Some(message) => Err(message),
                None => Ok(()),
            }
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

    struct FixedHost(ScriptRoute, Mutex<Vec<String>>);

    impl ScriptHost for FixedHost {
        fn route_script(&self, _owner_id: ClientId, _scope: ScriptScope) -> ScriptRoute {
            self.0
        }
        fn run_script_remotely(&self, _context_id: i64, script: &str) {
            self.1.lock().unwrap().push(script.to_string());
        }
    }

    fn detached(runner: &Arc<RecordingRunner>) -> EntityScript {
        let host: Weak<dyn ScriptHost> = Weak::<FixedHost>::new();
        EntityScript::new(7, "Crate", runner.clone(), host)
    }

    #[test]
    fn invoke_without_component_records_error() {
        let runner = Arc::new(RecordingRunner::default());
        let script = detached(&runner);
        assert!(!script.invoke());
        assert_eq!(script.get_error_text(), ERROR_NO_COMPONENT);

        script.set_script_component(Some(ScriptComponentData::default()));
        assert!(!script.invoke());
        assert_eq!(script.get_error_text(), ERROR_EMPTY_SCRIPT);
    }

    #[test]
    fn invoke_runs_source_and_clears_error() {
        let runner = Arc::new(RecordingRunner::default());
        let script = detached(&runner);
        script.set_script_source("let x = 1;");
        assert!(script.invoke());
        assert!(!script.has_error());
        assert_eq!(runner.runs.lock().unwrap()[0], (7, "let x = 1;".to_string()));

        *runner.fail_with.lock().unwrap() = Some("SyntaxError".to_string());
        assert!(!script.invoke());
        assert_eq!(script.get_error_text(), "SyntaxError");
    }

    #[test]
    fn property_change_posts_subscribed_message() {
        let runner = Arc::new(RecordingRunner::default());
        let script = detached(&runner);
        script.set_script_source("src");
        script.subscribe_to_property_change(2, 4, "lightChanged");
        script.subscribe_to_message("lightChanged", "onLight");

        script.on_property_changed(2, 5);
        assert!(runner.runs.lock().unwrap().is_empty());

        script.on_property_changed(2, 4);
        let runs = runner.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1, r#"onLight('lightChanged','{"id":2,"key":4}')"#);
    }

    #[test]
    fn non_local_route_forwards_to_leader() {
        let runner = Arc::new(RecordingRunner::default());
        let host = Arc::new(FixedHost(ScriptRoute::Leader, Mutex::new(Vec::new())));
        let weak: Weak<dyn ScriptHost> = Arc::downgrade(&host) as Weak<dyn ScriptHost>;
        let script = EntityScript::new(9, "Door", runner.clone(), weak);

        script.run_script("open()");
        assert!(runner.runs.lock().unwrap().is_empty());
        assert_eq!(host.1.lock().unwrap().as_slice(), ["open()".to_string()]);
    }

    #[test]
    fn source_change_resets_and_rebinds() {
        let runner = Arc::new(RecordingRunner::default());
        let script = detached(&runner);
        script.set_script_source("a");
        script.subscribe_to_message("m", "cb");
        script.bind();

        script.on_source_changed("b");
        assert_eq!(script.get_script_source(), "b");
        assert_eq!(*runner.resets.lock().unwrap(), 1);
        assert_eq!(*runner.binds.lock().unwrap(), 2);
        assert_eq!(runner.modules.lock().unwrap().get("Crate").map(String::as_str), Some("b"));

        script.post_message_to_script("m", "{}");
        assert!(runner.runs.lock().unwrap().is_empty());

        script.shutdown();
        assert!(runner.modules.lock().unwrap().is_empty());
    }
}
