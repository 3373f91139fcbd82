//! # Space Entities
//!
//! A `SpaceEntity` is one replicated avatar or object. Local setters change the
//! entity immediately and record the change as dirty state; the entity system turns
//! dirty state into exactly one outgoing patch per flush, then reports the combined
//! change to the update callback.

pub mod component;
pub mod message;
pub mod system;

pub use component::Component;
pub use message::{ComponentPatch, ObjectMessage, ObjectPatch};
pub use system::SpaceEntitySystem;

use log::{debug, error, warn};
use spaces_shared::constants::keys::*;
use spaces_shared::constants::network::NO_CLIENT_ID;
use spaces_shared::constants::script::{PROPERTY_OWNER_ID, PROPERTY_SCRIPT_SCOPE, PROPERTY_SCRIPT_SOURCE};
use spaces_shared::entity::{
    ComponentType, ComponentUpdateInfo, ComponentUpdateType, EntityUpdateFlags, LockType, ScriptScope,
    SpaceEntityType,
};
use spaces_shared::types::{ClientId, EntityId, SpaceTransform, Vector3, Vector4};
use spaces_shared::value::ReplicatedValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::lock;
use crate::script::{EntityScript, ScriptComponentData, ScriptHost, ScriptRunner};

/// Shared handle to a registered entity
pub type EntityHandle = Arc<SpaceEntity>;

/// Called after local or remote changes are applied
pub type EntityUpdateCallback = Arc<dyn Fn(&SpaceEntity, EntityUpdateFlags, &[ComponentUpdateInfo]) + Send + Sync>;

/// Called once when the entity leaves the registry
pub type EntityDestroyCallback = Box<dyn FnOnce(bool) + Send>;

/// Called when the transport acknowledges a patch for this entity
pub type EntityPatchSentCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct DirtyComponent {
    update_type: ComponentUpdateType,
    keys: BTreeSet<u32>,
}

struct EntityState {
    name: String,
    transform: SpaceTransform,
    owner_id: ClientId,
    parent_id: Option<EntityId>,
    is_transferable: bool,
    is_persistent: bool,
    selected_client_id: ClientId,
    lock_type: LockType,
    components: BTreeMap<u16, Component>,
    next_component_id: u16,

    dirty_view: BTreeMap<u16, ReplicatedValue>,
    dirty_components: BTreeMap<u16, DirtyComponent>,
    dirty_parent: Option<Option<EntityId>>,
    dirty_flags: EntityUpdateFlags,
    time_of_last_patch: Option<Instant>,
}

impl EntityState {
    fn record_view(&mut self, key: u16, value: ReplicatedValue, flag: EntityUpdateFlags) {
        self.dirty_view.insert(key, value);
        self.dirty_flags |= flag;
    }

    fn record_component(&mut self, id: u16, update_type: ComponentUpdateType, key: Option<u32>) {
        let entry = self
            .dirty_components
            .entry(id)
            .or_insert(DirtyComponent { update_type, keys: BTreeSet::new() });
        // An added component stays an add until flushed
        if update_type == ComponentUpdateType::Delete || entry.update_type != ComponentUpdateType::Add {
            entry.update_type = update_type;
        }
        if let Some(key) = key {
            entry.keys.insert(key);
        }
        self.dirty_flags |= EntityUpdateFlags::COMPONENTS;
    }

    fn script_component_id(&self) -> Option<u16> {
        self.components
            .values()
            .find(|c| c.get_component_type() == ComponentType::ScriptData)
            .map(Component::get_id)
    }

    fn script_data(&self) -> Option<ScriptComponentData> {
        let component = self.components.get(&self.script_component_id()?)?;
        Some(script_data_of(component))
    }

    fn view_snapshot(&self) -> BTreeMap<u16, ReplicatedValue> {
        BTreeMap::from([
            (COMPONENT_KEY_VIEW_ENTITY_NAME, ReplicatedValue::from(self.name.as_str())),
            (COMPONENT_KEY_VIEW_POSITION, ReplicatedValue::from(self.transform.position)),
            (COMPONENT_KEY_VIEW_ROTATION, ReplicatedValue::from(self.transform.rotation)),
            (COMPONENT_KEY_VIEW_SCALE, ReplicatedValue::from(self.transform.scale)),
            (COMPONENT_KEY_VIEW_SELECTED_CLIENT_ID, ReplicatedValue::Integer(self.selected_client_id as i64)),
            (COMPONENT_KEY_VIEW_LOCK_TYPE, ReplicatedValue::Integer(self.lock_type.as_raw())),
        ])
    }

    /// Apply one view value. Returns the flag it touched when the value changed.
    fn apply_view(&mut self, key: u16, value: &ReplicatedValue) -> Option<EntityUpdateFlags> {
        let applied = match key {
            COMPONENT_KEY_VIEW_ENTITY_NAME => value.get_string().map(|name| {
                let changed = self.name != name;
                self.name = name.to_string();
                (changed, EntityUpdateFlags::NAME)
            }),
            COMPONENT_KEY_VIEW_POSITION => value.get_vector3().map(|v| {
                let changed = self.transform.position != v;
                self.transform.position = v;
                (changed, EntityUpdateFlags::POSITION)
            }),
            COMPONENT_KEY_VIEW_ROTATION => value.get_vector4().map(|v| {
                let changed = self.transform.rotation != v;
                self.transform.rotation = v;
                (changed, EntityUpdateFlags::ROTATION)
            }),
            COMPONENT_KEY_VIEW_SCALE => value.get_vector3().map(|v| {
                let changed = self.transform.scale != v;
                self.transform.scale = v;
                (changed, EntityUpdateFlags::SCALE)
            }),
            COMPONENT_KEY_VIEW_SELECTED_CLIENT_ID => value.get_int().map(|id| {
                let changed = self.selected_client_id != id as u64;
                self.selected_client_id = id as u64;
                (changed, EntityUpdateFlags::SELECTION_ID)
            }),
            COMPONENT_KEY_VIEW_LOCK_TYPE => value.get_int().map(|raw| {
                let lock_type = LockType::from_raw(raw);
                let changed = self.lock_type != lock_type;
                self.lock_type = lock_type;
                (changed, EntityUpdateFlags::LOCK_TYPE)
            }),
            _ => return None,
        };

        match applied {
            Ok((true, flag)) => Some(flag),
            Ok((false, _)) => None,
            Err(e) => {
                warn!("Ignoring view component {:#x}: {}", key, e);
                None
            }
        }
    }
}

fn script_data_of(component: &Component) -> ScriptComponentData {
    ScriptComponentData {
        source: component
            .get_property(PROPERTY_SCRIPT_SOURCE)
            .and_then(|v| v.get_string().ok())
            .unwrap_or_default()
            .to_string(),
        owner_id: component
            .get_property(PROPERTY_OWNER_ID)
            .and_then(|v| v.get_int().ok())
            .map(|id| id as ClientId)
            .unwrap_or(NO_CLIENT_ID),
        scope: component
            .get_property(PROPERTY_SCRIPT_SCOPE)
            .and_then(|v| v.get_int().ok())
            .map(ScriptScope::from_raw)
            .unwrap_or_default(),
    }
}

#[derive(Default)]
struct EntityCallbacks {
    update: Option<EntityUpdateCallback>,
    destroy: Option<EntityDestroyCallback>,
    patch_sent: Option<EntityPatchSentCallback>,
}

/// Changes made to an entity, reported once to its update callback
#[derive(Debug, Default)]
pub(crate) struct AppliedChanges {
    flags: EntityUpdateFlags,
    components: Vec<ComponentUpdateInfo>,
    properties: Vec<(u16, u32)>,
    script_source: Option<String>,
}

impl AppliedChanges {
    fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.components.is_empty()
    }
}

pub struct SpaceEntity {
    id: EntityId,
    entity_type: SpaceEntityType,
    state: Mutex<EntityState>,
    script: EntityScript,
    callbacks: Mutex<EntityCallbacks>,
    system: Weak<SpaceEntitySystem>,
}

impl std::fmt::Debug for SpaceEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceEntity")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type)
            .field("name", &self.get_name())
            .finish()
    }
}

impl SpaceEntity {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EntityId,
        entity_type: SpaceEntityType,
        name: &str,
        transform: SpaceTransform,
        owner_id: ClientId,
        parent_id: Option<EntityId>,
        system: Weak<SpaceEntitySystem>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        let is_avatar = entity_type == SpaceEntityType::Avatar;
        let host: Weak<dyn ScriptHost> = system.clone();

        Self {
            id,
            entity_type,
            state: Mutex::new(EntityState {
                name: name.to_string(),
                transform,
                owner_id,
                parent_id,
                is_transferable: !is_avatar,
                is_persistent: !is_avatar,
                selected_client_id: 0,
                lock_type: LockType::None,
                components: BTreeMap::new(),
                next_component_id: 0,
                dirty_view: BTreeMap::new(),
                dirty_components: BTreeMap::new(),
                dirty_parent: None,
                dirty_flags: EntityUpdateFlags::NONE,
                time_of_last_patch: None,
            }),
            script: EntityScript::new(id, name, runner, host),
            callbacks: Mutex::new(EntityCallbacks::default()),
            system,
        }
    }

    /// Build an entity from a full snapshot received from the server
    pub(crate) fn from_message(
        message: &ObjectMessage,
        system: Weak<SpaceEntitySystem>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        let entity = Self::new(
            message.id,
            message.entity_type,
            "",
            SpaceTransform::identity(),
            message.owner_id,
            message.parent_id,
            system,
            runner,
        );

        let (name, script_data) = {
            let mut state = lock(&entity.state);
            state.is_transferable = message.is_transferable;
            state.is_persistent = message.is_persistent;
            for (key, value) in &message.view {
                state.apply_view(*key, value);
            }
            state.components = message.components.clone();
            state.next_component_id = next_free_id(&state.components);
            (state.name.clone(), state.script_data())
        };

        entity.script.set_module_name(&name);
        entity.script.set_script_component(script_data);

        entity
    }

    pub(crate) fn to_object_message(&self) -> ObjectMessage {
        let state = lock(&self.state);
        ObjectMessage {
            id: self.id,
            entity_type: self.entity_type,
            is_transferable: state.is_transferable,
            is_persistent: state.is_persistent,
            owner_id: state.owner_id,
            parent_id: state.parent_id,
            components: state.components.clone(),
            view: state.view_snapshot(),
        }
    }

    pub fn get_id(&self) -> EntityId {
        self.id
    }

    pub fn get_entity_type(&self) -> SpaceEntityType {
        self.entity_type
    }

    pub fn is_avatar(&self) -> bool {
        self.entity_type == SpaceEntityType::Avatar
    }

    pub fn get_name(&self) -> String {
        lock(&self.state).name.clone()
    }

    pub fn set_name(&self, name: &str) {
        {
            let mut state = lock(&self.state);
            state.name = name.to_string();
            state.record_view(COMPONENT_KEY_VIEW_ENTITY_NAME, ReplicatedValue::from(name), EntityUpdateFlags::NAME);
        }
        self.script.set_module_name(name);
    }

    pub fn get_transform(&self) -> SpaceTransform {
        lock(&self.state).transform
    }

    pub fn set_transform(&self, transform: SpaceTransform) {
        self.set_position(transform.position);
        self.set_rotation(transform.rotation);
        self.set_scale(transform.scale);
    }

    pub fn get_position(&self) -> Vector3 {
        lock(&self.state).transform.position
    }

    pub fn set_position(&self, position: Vector3) {
        let mut state = lock(&self.state);
        state.transform.position = position;
        state.record_view(COMPONENT_KEY_VIEW_POSITION, ReplicatedValue::from(position), EntityUpdateFlags::POSITION);
    }

    pub fn get_rotation(&self) -> Vector4 {
        lock(&self.state).transform.rotation
    }

    pub fn set_rotation(&self, rotation: Vector4) {
        let mut state = lock(&self.state);
        state.transform.rotation = rotation;
        state.record_view(COMPONENT_KEY_VIEW_ROTATION, ReplicatedValue::from(rotation), EntityUpdateFlags::ROTATION);
    }

    pub fn get_scale(&self) -> Vector3 {
        lock(&self.state).transform.scale
    }

    pub fn set_scale(&self, scale: Vector3) {
        let mut state = lock(&self.state);
        state.transform.scale = scale;
        state.record_view(COMPONENT_KEY_VIEW_SCALE, ReplicatedValue::from(scale), EntityUpdateFlags::SCALE);
    }

    pub fn get_owner_id(&self) -> ClientId {
        lock(&self.state).owner_id
    }

    pub fn get_parent_id(&self) -> Option<EntityId> {
        lock(&self.state).parent_id
    }

    pub fn set_parent_id(&self, parent_id: Option<EntityId>) {
        let mut state = lock(&self.state);
        if state.parent_id == parent_id {
            return;
        }
        state.parent_id = parent_id;
        state.dirty_parent = Some(parent_id);
        state.dirty_flags |= EntityUpdateFlags::PARENT;
    }

    pub fn get_is_transferable(&self) -> bool {
        lock(&self.state).is_transferable
    }

    pub fn get_is_persistent(&self) -> bool {
        lock(&self.state).is_persistent
    }

    pub fn get_selecting_client_id(&self) -> ClientId {
        lock(&self.state).selected_client_id
    }

    pub fn is_selected(&self) -> bool {
        self.get_selecting_client_id() != NO_CLIENT_ID
    }

    /// Select through the owning system; false when someone else holds the selection
    pub fn select(&self) -> bool {
        match self.system.upgrade() {
            Some(system) => system.set_selection_state_of_entity(true, self),
            None => false,
        }
    }

    pub fn deselect(&self) -> bool {
        match self.system.upgrade() {
            Some(system) => system.set_selection_state_of_entity(false, self),
            None => false,
        }
    }

    pub fn get_lock_type(&self) -> LockType {
        lock(&self.state).lock_type
    }

    pub fn is_locked(&self) -> bool {
        self.get_lock_type() != LockType::None
    }

    pub fn lock(&self) {
        self.set_lock_type(LockType::UserAgnostic);
    }

    pub fn unlock(&self) {
        self.set_lock_type(LockType::None);
    }

    fn set_lock_type(&self, lock_type: LockType) {
        let mut state = lock(&self.state);
        state.lock_type = lock_type;
        state.record_view(
            COMPONENT_KEY_VIEW_LOCK_TYPE,
            ReplicatedValue::Integer(lock_type.as_raw()),
            EntityUpdateFlags::LOCK_TYPE,
        );
    }

    /// Whether the local client may currently change this entity
    pub fn is_modifiable(&self) -> bool {
        let local = self.system.upgrade().map(|s| s.local_client_id()).unwrap_or(NO_CLIENT_ID);
        self.is_modifiable_by(local)
    }

    pub(crate) fn is_modifiable_by(&self, local_client: ClientId) -> bool {
        let state = lock(&self.state);
        (state.owner_id == local_client || state.is_transferable) && state.lock_type != LockType::UserAgnostic
    }

    /// Modifiable, or the pending patch is the one that unlocks it
    pub(crate) fn can_flush(&self, local_client: ClientId) -> bool {
        if self.is_modifiable_by(local_client) {
            return true;
        }
        let state = lock(&self.state);
        matches!(
            state.dirty_view.get(&COMPONENT_KEY_VIEW_LOCK_TYPE),
            Some(ReplicatedValue::Integer(raw)) if LockType::from_raw(*raw) == LockType::None
        )
    }

    /// Add an empty component and return its id. None when every component id is taken.
    pub fn add_component(&self, component_type: ComponentType) -> Option<u16> {
        let mut state = lock(&self.state);
        let Some(id) = free_component_id(&state.components, state.next_component_id) else {
            error!("Entity {} has no free component id", self.id);
            return None;
        };
        state.next_component_id = id.saturating_add(1);
        state.components.insert(id, Component::new(id, component_type));
        state.record_component(id, ComponentUpdateType::Add, None);
        debug!("Added component {} ({:?}) to entity {}", id, component_type, self.id);
        Some(id)
    }

    pub fn remove_component(&self, component_id: u16) -> bool {
        let mut state = lock(&self.state);
        if state.components.remove(&component_id).is_none() {
            return false;
        }
        state.record_component(component_id, ComponentUpdateType::Delete, None);
        true
    }

    pub fn get_component(&self, component_id: u16) -> Option<Component> {
        lock(&self.state).components.get(&component_id).cloned()
    }

    pub fn get_components(&self) -> BTreeMap<u16, Component> {
        lock(&self.state).components.clone()
    }

    pub fn find_first_component_of_type(&self, component_type: ComponentType) -> Option<Component> {
        lock(&self.state)
            .components
            .values()
            .find(|c| c.get_component_type() == component_type)
            .cloned()
    }

    pub fn get_component_property(&self, component_id: u16, key: u32) -> Option<ReplicatedValue> {
        lock(&self.state)
            .components
            .get(&component_id)
            .and_then(|c| c.get_property(key))
            .cloned()
    }

    /// Set one property. False when the component does not exist.
    pub fn set_component_property(&self, component_id: u16, key: u32, value: ReplicatedValue) -> bool {
        let script_data = {
            let mut state = lock(&self.state);
            let Some(component) = state.components.get_mut(&component_id) else {
                return false;
            };
            if !component.set_property(key, value) {
                return true;
            }
            let is_script = component.get_component_type() == ComponentType::ScriptData;
            state.record_component(component_id, ComponentUpdateType::Update, Some(key));
            is_script.then(|| state.script_data()).flatten()
        };

        if let Some(data) = script_data {
            self.script.set_script_component(Some(data));
        }
        true
    }

    /// Replace the script source, creating the script data component when missing
    pub fn set_script_source(&self, source: &str) {
        let existing = lock(&self.state).script_component_id();
        let Some(component_id) = existing.or_else(|| self.add_component(ComponentType::ScriptData)) else {
            return;
        };

        self.set_component_property(component_id, PROPERTY_SCRIPT_SOURCE, ReplicatedValue::from(source));
    }

    pub fn get_script_source(&self) -> String {
        self.script.get_script_source()
    }

    pub fn script(&self) -> &EntityScript {
        &self.script
    }

    /// Record `client_id` as the script owner. No-op without a script component.
    pub(crate) fn set_script_owner(&self, client_id: ClientId) -> bool {
        let component_id = match lock(&self.state).script_component_id() {
            Some(id) => id,
            None => return false,
        };
        let current = self.script.get_owner_id();
        if current == client_id {
            return false;
        }
        self.set_component_property(component_id, PROPERTY_OWNER_ID, ReplicatedValue::Integer(client_id as i64));
        true
    }

    pub fn set_update_callback(&self, callback: EntityUpdateCallback) {
        lock(&self.callbacks).update = Some(callback);
    }

    pub fn set_destroy_callback(&self, callback: EntityDestroyCallback) {
        lock(&self.callbacks).destroy = Some(callback);
    }

    pub fn set_patch_sent_callback(&self, callback: EntityPatchSentCallback) {
        lock(&self.callbacks).patch_sent = Some(callback);
    }

    /// Queue this entity's pending changes for the next flush
    pub fn queue_update(&self) {
        if let Some(system) = self.system.upgrade() {
            system.queue_entity_update(self);
        }
    }

    /// Queue an update on the next entity tick rather than the current one
    pub fn mark_for_update(&self) {
        if let Some(system) = self.system.upgrade() {
            system.mark_entity_for_update(self);
        }
    }

    pub(crate) fn patch_window_elapsed(&self, now: Instant, rate: Duration) -> bool {
        match lock(&self.state).time_of_last_patch {
            Some(last) => now.saturating_duration_since(last) >= rate,
            None => true,
        }
    }

    /// Claim ownership for `local_client` and drain dirty state into one patch
    pub(crate) fn take_patch(&self, local_client: ClientId, now: Instant) -> (ObjectPatch, AppliedChanges) {
        self.set_script_owner(local_client);

        let mut state = lock(&self.state);
        let mut changes = AppliedChanges::default();

        if state.owner_id != local_client {
            state.owner_id = local_client;
            state.dirty_flags |= EntityUpdateFlags::OWNER;
        }

        let mut patch = ObjectPatch::new(self.id, local_client);
        patch.parent = state.dirty_parent.take();
        patch.view = std::mem::take(&mut state.dirty_view);

        for (id, dirty) in std::mem::take(&mut state.dirty_components) {
            let change = match (dirty.update_type, state.components.get(&id)) {
                (ComponentUpdateType::Delete, _) | (_, None) => ComponentPatch::Delete,
                (_, Some(component)) => ComponentPatch::Upsert(component.clone()),
            };
            let update_type = match change {
                ComponentPatch::Delete => ComponentUpdateType::Delete,
                ComponentPatch::Upsert(_) => dirty.update_type,
            };
            changes.components.push(ComponentUpdateInfo { component_id: id, update_type });
            changes.properties.extend(dirty.keys.iter().map(|key| (id, *key)));
            patch.components.insert(id, change);
        }

        changes.flags = std::mem::replace(&mut state.dirty_flags, EntityUpdateFlags::NONE);
        state.time_of_last_patch = Some(now);
        (patch, changes)
    }

    /// Apply a remote patch. Applying the same patch twice changes nothing the second time.
    pub(crate) fn apply_remote_patch(&self, patch: &ObjectPatch) -> AppliedChanges {
        let mut changes = AppliedChanges::default();
        let (name, script_data) = {
            let mut state = lock(&self.state);

            if state.owner_id != patch.owner_id {
                state.owner_id = patch.owner_id;
                changes.flags |= EntityUpdateFlags::OWNER;
            }

            if let Some(parent) = patch.parent {
                if state.parent_id != parent {
                    state.parent_id = parent;
                    changes.flags |= EntityUpdateFlags::PARENT;
                }
            }

            for (key, value) in &patch.view {
                if let Some(flag) = state.apply_view(*key, value) {
                    changes.flags |= flag;
                }
            }

            let script_component = state.script_component_id();
            for (id, change) in &patch.components {
                match change {
                    ComponentPatch::Delete => {
                        if state.components.remove(id).is_some() {
                            changes.components.push(ComponentUpdateInfo {
                                component_id: *id,
                                update_type: ComponentUpdateType::Delete,
                            });
                        }
                    }
                    ComponentPatch::Upsert(incoming) => {
                        let (update_type, changed_keys) = match state.components.get(id) {
                            Some(existing) if existing == incoming => continue,
                            Some(existing) => (ComponentUpdateType::Update, changed_keys(existing, incoming)),
                            None => (ComponentUpdateType::Add, incoming.get_properties().keys().copied().collect()),
                        };

                        if Some(*id) == script_component || incoming.get_component_type() == ComponentType::ScriptData {
                            if changed_keys.contains(&PROPERTY_SCRIPT_SOURCE) {
                                changes.script_source = Some(script_data_of(incoming).source);
                            }
                        }

                        changes.properties.extend(changed_keys.into_iter().map(|key| (*id, key)));
                        changes.components.push(ComponentUpdateInfo { component_id: *id, update_type });
                        state.components.insert(*id, incoming.clone());
                    }
                }
            }

            if !changes.components.is_empty() {
                changes.flags |= EntityUpdateFlags::COMPONENTS;
                let next = next_free_id(&state.components);
                state.next_component_id = state.next_component_id.max(next);
            }

            (state.name.clone(), state.script_data())
        };

        if changes.flags.contains(EntityUpdateFlags::NAME) {
            self.script.set_module_name(&name);
        }
        let had_script = self.script.has_entity_script_component();
        self.script.set_script_component(script_data);
        if let (true, Some(source)) = (had_script, changes.script_source.as_deref()) {
            self.script.on_source_changed(source);
        }

        changes
    }

    /// Tell the script about changed properties, then fire the update callback once
    pub(crate) fn notify_changes(&self, changes: &AppliedChanges) {
        if changes.is_empty() {
            return;
        }

        for (component_id, key) in &changes.properties {
            self.script.on_property_changed(*component_id, *key);
        }

        let callback = lock(&self.callbacks).update.clone();
        if let Some(callback) = callback {
            callback(self, changes.flags, &changes.components);
        }
    }

    pub(crate) fn fire_patch_sent(&self, ok: bool) {
        let callback = lock(&self.callbacks).patch_sent.clone();
        if let Some(callback) = callback {
            callback(ok);
        }
    }

    pub(crate) fn fire_destroy(&self) {
        let callback = lock(&self.callbacks).destroy.take();
        if let Some(callback) = callback {
            callback(true);
        }
    }

    /// Exclusive selection: select requires nobody holding it, deselect requires the local client to hold it
    pub(crate) fn try_set_selected(&self, selected: bool, local_client: ClientId) -> bool {
        let mut state = lock(&self.state);
        let next = match (selected, state.selected_client_id) {
            (true, NO_CLIENT_ID) => local_client,
            (false, holder) if holder == local_client && holder != NO_CLIENT_ID => NO_CLIENT_ID,
            _ => return false,
        };
        state.selected_client_id = next;
        state.record_view(
            COMPONENT_KEY_VIEW_SELECTED_CLIENT_ID,
            ReplicatedValue::Integer(next as i64),
            EntityUpdateFlags::SELECTION_ID,
        );
        true
    }

    /// Drop a selection held by a client that left. Local only; not replicated.
    pub(crate) fn clear_selection_of(&self, client_id: ClientId) -> bool {
        let mut state = lock(&self.state);
        if state.selected_client_id == client_id && client_id != NO_CLIENT_ID {
            state.selected_client_id = NO_CLIENT_ID;
            true
        } else {
            false
        }
    }
}

/// First unused id from `start` up to the view key range, then wrapping to 0
fn free_component_id(components: &BTreeMap<u16, Component>, start: u16) -> Option<u16> {
    let start = start.min(COMPONENT_KEY_END_COMPONENTS);
    (start..COMPONENT_KEY_END_COMPONENTS)
        .chain(0..start)
        .find(|id| !components.contains_key(id))
}

fn next_free_id(components: &BTreeMap<u16, Component>) -> u16 {
    components
        .keys()
        .next_back()
        .map(|id| id.saturating_add(1))
        .unwrap_or(0)
}

fn changed_keys(existing: &Component, incoming: &Component) -> Vec<u32> {
    let old = existing.get_properties();
    let new = incoming.get_properties();
    new.iter()
        .filter(|(key, value)| old.get(key) != Some(value))
        .map(|(key, _)| *key)
        .chain(old.keys().filter(|key| !new.contains_key(key)).copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptRunner;

    struct NullRunner;

    impl ScriptRunner for NullRunner {
        fn create_context(&self, _context_id: i64) -> bool {
            true
        }
        fn destroy_context(&self, _context_id: i64) -> bool {
            true
        }
        fn reset_context(&self, _context_id: i64) -> bool {
            true
        }
        fn bind_context(&self, _context_id: i64) -> bool {
            true
        }
        fn run_script(&self, _context_id: i64, _script: &str) -> Result<(), String> {
            Ok(())
        }
        fn set_module_source(&self, _module_path: &str, _source: &str) {}
        fn clear_module_source(&self, _module_path: &str) {}
        fn exists_in_context(&self, _context_id: i64, _object_name: &str) -> bool {
            false
        }
    }

    fn detached(id: EntityId, entity_type: SpaceEntityType, owner: ClientId) -> SpaceEntity {
        SpaceEntity::new(id, entity_type, "Thing", SpaceTransform::identity(), owner, None, Weak::new(), Arc::new(NullRunner))
    }

    #[test]
    fn modifiability_follows_owner_transferable_and_lock() {
        let avatar = detached(1, SpaceEntityType::Avatar, 10);
        assert!(avatar.is_modifiable_by(10));
        assert!(!avatar.is_modifiable_by(11));

        let object = detached(2, SpaceEntityType::Object, 10);
        assert!(object.is_modifiable_by(11));
        object.lock();
        assert!(!object.is_modifiable_by(10));
        assert!(!object.can_flush(10));
        object.unlock();
        assert!(object.can_flush(10));
    }

    #[test]
    fn take_patch_claims_ownership_and_drains_dirty_state() {
        let entity = detached(3, SpaceEntityType::Object, 20);
        entity.set_position(Vector3::new(1.0, 2.0, 3.0));
        let light = entity.add_component(ComponentType::Light).unwrap();
        entity.set_component_property(light, 4, ReplicatedValue::Float(0.25));

        let (patch, changes) = entity.take_patch(21, Instant::now());
        assert_eq!(patch.owner_id, 21);
        assert_eq!(entity.get_owner_id(), 21);
        assert_eq!(
            patch.view.get(&COMPONENT_KEY_VIEW_POSITION),
            Some(&ReplicatedValue::from(Vector3::new(1.0, 2.0, 3.0)))
        );
        assert!(matches!(patch.components.get(&light), Some(ComponentPatch::Upsert(_))));
        assert!(changes.flags.contains(EntityUpdateFlags::POSITION | EntityUpdateFlags::OWNER));
        assert_eq!(changes.components[0].update_type, ComponentUpdateType::Add);

        let (second, _) = entity.take_patch(21, Instant::now());
        assert!(second.view.is_empty());
        assert!(second.components.is_empty());
    }

    #[test]
    fn remote_patch_is_idempotent() {
        let entity = detached(4, SpaceEntityType::Object, 1);
        let mut component = Component::new(0, ComponentType::Text);
        component.set_property(1, ReplicatedValue::from("hello"));

        let mut patch = ObjectPatch::new(4, 2);
        patch.components.insert(0, ComponentPatch::Upsert(component));
        patch.view.insert(COMPONENT_KEY_VIEW_ENTITY_NAME, ReplicatedValue::from("Sign"));

        let first = entity.apply_remote_patch(&patch);
        assert!(first.flags.contains(EntityUpdateFlags::NAME | EntityUpdateFlags::COMPONENTS | EntityUpdateFlags::OWNER));
        let snapshot = entity.to_object_message();

        let second = entity.apply_remote_patch(&patch);
        assert!(second.is_empty());
        assert_eq!(entity.to_object_message(), snapshot);
    }

    #[test]
    fn selection_is_exclusive() {
        let entity = detached(5, SpaceEntityType::Object, 1);
        assert!(entity.try_set_selected(true, 7));
        assert!(!entity.try_set_selected(true, 8));
        assert!(!entity.try_set_selected(false, 8));
        assert!(entity.try_set_selected(false, 7));
        assert!(!entity.try_set_selected(false, 7));
    }

    #[test]
    fn script_source_creates_script_component() {
        let entity = detached(6, SpaceEntityType::Object, 1);
        entity.set_script_source("print(1)");
        assert_eq!(entity.get_script_source(), "print(1)");
        assert!(entity.find_first_component_of_type(ComponentType::ScriptData).is_some());
        assert!(entity.script().has_entity_script_component());

        assert!(entity.set_script_owner(9));
        assert!(!entity.set_script_owner(9));
        assert_eq!(entity.script().get_owner_id(), 9);
    }

    #[test]
    fn snapshot_rebuilds_entity() {
        let original = detached(8, SpaceEntityType::Avatar, 3);
        original.set_name("Bob");
        original.set_position(Vector3::new(4.0, 5.0, 6.0));
        original.add_component(ComponentType::AvatarData);

        let rebuilt = SpaceEntity::from_message(&original.to_object_message(), Weak::new(), Arc::new(NullRunner));
        assert_eq!(rebuilt.get_name(), "Bob");
        assert_eq!(rebuilt.get_position(), Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(rebuilt.get_components(), original.get_components());
        assert_eq!(rebuilt.add_component(ComponentType::Custom), Some(1));
    }

    #[test]
    fn component_ids_wrap_below_view_keys() {
        let entity = detached(9, SpaceEntityType::Object, 1);
        let last = COMPONENT_KEY_END_COMPONENTS - 1;
        let mut patch = ObjectPatch::new(9, 1);
        patch.components.insert(0, ComponentPatch::Upsert(Component::new(0, ComponentType::Text)));
        patch.components.insert(last, ComponentPatch::Upsert(Component::new(last, ComponentType::Light)));
        entity.apply_remote_patch(&patch);

        assert_eq!(entity.add_component(ComponentType::Custom), Some(1));
        assert_eq!(entity.add_component(ComponentType::Custom), Some(2));

        let components = entity.get_components();
        assert_eq!(components.len(), 4);
        assert_eq!(components[&last].get_component_type(), ComponentType::Light);
        assert!(components.keys().all(|id| !is_view_component(*id)));
    }
}
