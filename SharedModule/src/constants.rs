//! # Shared Constants
//!
//! Constants used across the wire contracts and the client.

/// Version of the Spaces client
pub const SPACES_CLIENT_VERSION: &str = "0.1.0";

/// Component and view-component key layout
pub mod keys {
    /// Real component ids are below this value; view components live at or above it
    pub const COMPONENT_KEY_END_COMPONENTS: u16 = 0xFFDF;

    pub const COMPONENT_KEY_VIEW_ENTITY_NAME: u16 = 0xFFE0;
    pub const COMPONENT_KEY_VIEW_POSITION: u16 = 0xFFE1;
    pub const COMPONENT_KEY_VIEW_ROTATION: u16 = 0xFFE2;
    pub const COMPONENT_KEY_VIEW_SCALE: u16 = 0xFFE3;
    pub const COMPONENT_KEY_VIEW_SELECTED_CLIENT_ID: u16 = 0xFFE4;
    pub const COMPONENT_KEY_VIEW_LOCK_TYPE: u16 = 0xFFE5;

    /// Wire type marking a component removal inside a patch
    pub const COMPONENT_TYPE_DELETE: u64 = u64::MAX;

    pub fn is_view_component(id: u16) -> bool {
        id >= COMPONENT_KEY_END_COMPONENTS
    }
}

/// Property keys of the script data component
pub mod script {
    pub const PROPERTY_SCRIPT_SOURCE: u32 = 1;
    pub const PROPERTY_OWNER_ID: u32 = 2;
    pub const PROPERTY_SCRIPT_SCOPE: u32 = 3;

    /// Posted to every script the local client runs on each entity tick
    pub const MSG_ENTITY_TICK: &str = "entityTick";

    /// Posted once when the initial entity set has been retrieved
    pub const MSG_ENTITIES_LOADED: &str = "entitiesLoaded";

    pub const ERROR_NO_COMPONENT: &str = "No script component";
    pub const ERROR_EMPTY_SCRIPT: &str = "Script is empty";
}

/// Entity system constants
pub mod entity {
    /// Minimum interval between two outgoing patches for one entity (milliseconds)
    pub const DEFAULT_PATCH_RATE_MS: u64 = 90;

    /// Entities requested per `PageScopedObjects` call
    pub const ENTITY_PAGE_LIMIT: u64 = 100;

    /// Argument to `DeleteObjects` meaning every entity the client owns
    pub const ALL_ENTITIES_ID: u64 = u64::MAX;
}

/// Network constants
pub mod network {
    /// Recipient id addressing every connected client
    pub const ALL_CLIENTS_ID: u64 = u64::MAX;

    /// Reported when no client id has been assigned
    pub const NO_CLIENT_ID: u64 = 0;

    pub const CLIENT_ELECTION_MESSAGE: &str = "ClientElectionMessage";
    pub const REMOTE_RUN_SCRIPT_MESSAGE: &str = "RemoteRunScriptMessage";

    pub const DISCONNECT_REASON_CLIENT: &str = "Client called disconnect.";
}

/// Hub method names understood by the backend
pub mod hub {
    pub const DELETE_OBJECTS: &str = "DeleteObjects";
    pub const GENERATE_OBJECT_IDS: &str = "GenerateObjectIds";
    pub const GET_CLIENT_ID: &str = "GetClientId";
    pub const PAGE_SCOPED_OBJECTS: &str = "PageScopedObjects";
    pub const RESET_SCOPES: &str = "ResetScopes";
    pub const SEND_EVENT_MESSAGE: &str = "SendEventMessage";
    pub const SEND_OBJECT_MESSAGE: &str = "SendObjectMessage";
    pub const SEND_OBJECT_NOT_FOUND: &str = "SendObjectNotFound";
    pub const SEND_OBJECT_PATCHES: &str = "SendObjectPatches";
    pub const SET_ALLOW_SELF_MESSAGING: &str = "SetAllowSelfMessaging";
    pub const SET_SCOPES: &str = "SetScopes";
    pub const START_LISTENING: &str = "StartListening";
    pub const STOP_LISTENING: &str = "StopListening";

    pub const ON_OBJECT_MESSAGE: &str = "OnObjectMessage";
    pub const ON_OBJECT_PATCH: &str = "OnObjectPatch";
    pub const ON_REQUEST_TO_SEND_OBJECT: &str = "OnRequestToSendObject";
    pub const ON_REQUEST_TO_DISCONNECT: &str = "OnRequestToDisconnect";
    pub const ON_EVENT_MESSAGE: &str = "OnEventMessage";
}
