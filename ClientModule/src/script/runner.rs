//! # Script Runner Interfaces
//!
//! The scripting runtime is an external capability. Contexts are addressed by an
//! opaque id; the entity system uses the entity id.

use spaces_shared::entity::ScriptScope;
use spaces_shared::types::ClientId;

/// External scripting runtime
pub trait ScriptRunner: Send + Sync {
    fn create_context(&self, context_id: i64) -> bool;
    fn destroy_context(&self, context_id: i64) -> bool;
    fn reset_context(&self, context_id: i64) -> bool;

    /// Expose the entity bindings to the context
    fn bind_context(&self, context_id: i64) -> bool;

    /// Run script text in a context. Errors carry the runtime's message.
    fn run_script(&self, context_id: i64, script: &str) -> Result<(), String>;

    /// Register source importable as a module under `module_path`
    fn set_module_source(&self, module_path: &str, source: &str);
    fn clear_module_source(&self, module_path: &str);

    fn exists_in_context(&self, context_id: i64, object_name: &str) -> bool;
}

/// Where a script run should happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRoute {
    /// This client runs it
    Local,
    /// Forward it to the elected leader
    Leader,
    /// Another client is responsible; do nothing here
    Skip,
}

/// Decides script routing on behalf of entity scripts
pub trait ScriptHost: Send + Sync {
    fn route_script(&self, owner_id: ClientId, scope: ScriptScope) -> ScriptRoute;

    fn run_script_remotely(&self, context_id: i64, script: &str);
}
