//! # Space Entity System
//!
//! Registry of every entity in the connected space plus the pending-operation
//! queues that feed it.
//!
//! Inbound transport handlers and local callers only push onto the queues. The
//! tick (`process_pending_entity_operations`) is the single point that applies
//! them, in this order:
//! 1. pending adds,
//! 2. pending removes,
//! 3. inbound patches in arrival order,
//! 4. the outgoing flush, which sends every ready patch in one call.
//!
//! Lock order: registry, then entity state, then election. Entity scripts lock
//! internally and never hold a lock while the runtime executes.
//! The queue lock and the tick-list lock are never held while taking another lock.

use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use spaces_shared::constants::hub::*;
use spaces_shared::constants::network::NO_CLIENT_ID;
use spaces_shared::constants::script::{MSG_ENTITIES_LOADED, MSG_ENTITY_TICK};
use spaces_shared::entity::{ScriptScope, SpaceEntityType};
use spaces_shared::types::{ClientId, EntityId, SpaceTransform};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use super::{AppliedChanges, EntityHandle, ObjectMessage, ObjectPatch, SpaceEntity};
use crate::election::{ClientElectionManager, LeadershipTransition};
use crate::error::{MultiplayerError, MultiplayerResult};
use crate::lock;
use crate::net::event_bus::NetworkEventBus;
use crate::net::session::Session;
use crate::script::{ScriptHost, ScriptRoute, ScriptRunner};
use crate::serialization::parse_u64;

/// Completion of `create_avatar`/`create_object`; `None` on failure
pub type EntityCreatedCallback = Box<dyn FnOnce(Option<EntityHandle>) + Send>;

/// Called for each entity created by another client or retrieved from the server
pub type RemoteEntityCreatedCallback = Arc<dyn Fn(&EntityHandle) + Send + Sync>;

pub type BoolCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// One-shot success callback
pub type CallbackHandler = Box<dyn FnOnce(bool) + Send>;

#[derive(Default)]
struct PendingQueues {
    adds: Vec<EntityHandle>,
    removes: Vec<EntityHandle>,
    incoming: VecDeque<ObjectPatch>,
    outgoing: Vec<EntityId>,
    outgoing_set: HashSet<EntityId>,
    all_entities_retrieved: bool,
}

impl PendingQueues {
    fn queue_outgoing(&mut self, id: EntityId) {
        if self.outgoing_set.insert(id) {
            self.outgoing.push(id);
        }
    }
}

#[derive(Default)]
pub struct Registry {
    entities: Vec<EntityHandle>,
    avatars: Vec<EntityHandle>,
    objects: Vec<EntityHandle>,
    selected: Vec<EntityHandle>,
}

impl Registry {
    fn find(&self, id: EntityId) -> Option<&EntityHandle> {
        self.entities.iter().find(|e| e.get_id() == id)
    }

    fn remove(&mut self, id: EntityId) -> Option<EntityHandle> {
        let index = self.entities.iter().position(|e| e.get_id() == id)?;
        let entity = self.entities.remove(index);
        self.avatars.retain(|e| e.get_id() != id);
        self.objects.retain(|e| e.get_id() != id);
        self.selected.retain(|e| e.get_id() != id);
        Some(entity)
    }
}

/// Read access to the registry while the tick is held off. Dropping it unlocks.
pub struct EntityRegistryGuard<'a>(MutexGuard<'a, Registry>);

impl EntityRegistryGuard<'_> {
    pub fn entities(&self) -> &[EntityHandle] {
        &self.0.entities
    }

    pub fn avatars(&self) -> &[EntityHandle] {
        &self.0.avatars
    }

    pub fn objects(&self) -> &[EntityHandle] {
        &self.0.objects
    }

    pub fn selected_entities(&self) -> &[EntityHandle] {
        &self.0.selected
    }
}

#[derive(Default)]
struct SystemCallbacks {
    entity_created: Option<RemoteEntityCreatedCallback>,
    initial_entities_retrieved: Option<BoolCallback>,
    script_system_ready: Option<BoolCallback>,
}

pub struct SpaceEntitySystem {
    session: Arc<Session>,
    event_bus: Arc<NetworkEventBus>,
    runner: Arc<dyn ScriptRunner>,
    self_ref: Weak<SpaceEntitySystem>,

    registry: Mutex<Registry>,
    queues: Mutex<PendingQueues>,
    tick_updates: Mutex<Vec<EntityId>>,
    election: Mutex<Option<Arc<ClientElectionManager>>>,
    callbacks: Mutex<SystemCallbacks>,

    initial_load_complete: AtomicBool,
    script_system_ready_fired: AtomicBool,
    entity_tick_enabled: AtomicBool,
    last_tick: Mutex<Option<Instant>>,
}

impl SpaceEntitySystem {
    pub(crate) fn new(session: Arc<Session>, event_bus: Arc<NetworkEventBus>, runner: Arc<dyn ScriptRunner>) -> Arc<Self> {
        let election_enabled = session.config().leader_election_enabled;

        let system = Arc::new_cyclic(|self_ref| Self {
            session,
            event_bus,
            runner,
            self_ref: self_ref.clone(),
            registry: Mutex::new(Registry::default()),
            queues: Mutex::new(PendingQueues::default()),
            tick_updates: Mutex::new(Vec::new()),
            election: Mutex::new(None),
            callbacks: Mutex::new(SystemCallbacks::default()),
            initial_load_complete: AtomicBool::new(false),
            script_system_ready_fired: AtomicBool::new(false),
            entity_tick_enabled: AtomicBool::new(false),
            last_tick: Mutex::new(None),
        });

        if election_enabled {
            system.enable_leader_election();
        }
        system.bind_network_handlers();
        system
    }

    fn bind_network_handlers(&self) {
        let transport = self.session.transport();

        let weak = self.self_ref.clone();
        transport.on(
            ON_OBJECT_MESSAGE,
            Arc::new(move |args| {
                if let Some(system) = weak.upgrade() {
                    system.on_object_message(args);
                }
            }),
        );

        let weak = self.self_ref.clone();
        transport.on(
            ON_OBJECT_PATCH,
            Arc::new(move |args| {
                if let Some(system) = weak.upgrade() {
                    system.on_object_patch(args);
                }
            }),
        );

        let weak = self.self_ref.clone();
        transport.on(
            ON_REQUEST_TO_SEND_OBJECT,
            Arc::new(move |args| {
                if let Some(system) = weak.upgrade() {
                    system.on_request_to_send_object(args);
                }
            }),
        );
    }

    pub(crate) fn local_client_id(&self) -> ClientId {
        self.session.client_id()
    }

    fn election(&self) -> Option<Arc<ClientElectionManager>> {
        lock(&self.election).clone()
    }

    pub fn set_entity_created_callback(&self, callback: RemoteEntityCreatedCallback) {
        lock(&self.callbacks).entity_created = Some(callback);
    }

    pub fn set_initial_entities_retrieved_callback(&self, callback: BoolCallback) {
        lock(&self.callbacks).initial_entities_retrieved = Some(callback);
    }

    pub fn set_script_system_ready_callback(&self, callback: BoolCallback) {
        lock(&self.callbacks).script_system_ready = Some(callback);
    }

    pub fn create_avatar(&self, name: &str, transform: SpaceTransform, callback: EntityCreatedCallback) {
        self.create_entity(SpaceEntityType::Avatar, name, transform, None, callback);
    }

    pub fn create_object(&self, name: &str, transform: SpaceTransform, callback: EntityCreatedCallback) {
        self.create_entity(SpaceEntityType::Object, name, transform, None, callback);
    }

    pub fn create_object_with_parent(
        &self,
        name: &str,
        transform: SpaceTransform,
        parent_id: EntityId,
        callback: EntityCreatedCallback,
    ) {
        self.create_entity(SpaceEntityType::Object, name, transform, Some(parent_id), callback);
    }

    fn create_entity(
        &self,
        entity_type: SpaceEntityType,
        name: &str,
        transform: SpaceTransform,
        parent_id: Option<EntityId>,
        callback: EntityCreatedCallback,
    ) {
        if !self.session.is_connected() {
            warn!("Cannot create entity '{}' while not connected", name);
            callback(None);
            return;
        }

        let weak = self.self_ref.clone();
        let name = name.to_string();
        self.session.invoke(
            GENERATE_OBJECT_IDS,
            json!([1]),
            Box::new(move |result| {
                let Some(system) = weak.upgrade() else {
                    callback(None);
                    return;
                };

                let id = result.map_err(MultiplayerError::from).and_then(|value| {
                    parse_u64(&value).ok_or_else(|| MultiplayerError::UnexpectedResponse(value.to_string()))
                });

                match id {
                    Ok(id) => system.send_new_entity(id, entity_type, &name, transform, parent_id, callback),
                    Err(e) => {
                        error!("Failed to generate an id for entity '{}': {}", name, e);
                        callback(None);
                    }
                }
            }),
        );
    }

    fn send_new_entity(
        &self,
        id: EntityId,
        entity_type: SpaceEntityType,
        name: &str,
        transform: SpaceTransform,
        parent_id: Option<EntityId>,
        callback: EntityCreatedCallback,
    ) {
        let entity: EntityHandle = Arc::new(SpaceEntity::new(
            id,
            entity_type,
            name,
            transform,
            self.local_client_id(),
            parent_id,
            self.self_ref.clone(),
            self.runner.clone(),
        ));

        let payload = match entity.to_object_message().to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialise new entity {}: {}", id, e);
                callback(None);
                return;
            }
        };

        let weak = self.self_ref.clone();
        self.session.invoke(
            SEND_OBJECT_MESSAGE,
            json!([[payload]]),
            Box::new(move |result| match (result, weak.upgrade()) {
                (Ok(_), Some(system)) => {
                    if system.register_entity(&entity) {
                        system.on_entity_registered(&entity);
                    }
                    info!("Created {:?} {} ({})", entity.get_entity_type(), entity.get_name(), entity.get_id());
                    callback(Some(entity));
                }
                (Err(e), _) => {
                    error!("Failed to send new entity {}: {}", entity.get_id(), e);
                    callback(None);
                }
                (Ok(_), None) => callback(None),
            }),
        );
    }

    /// Queue an entity for registration on the next tick. Safe from any thread.
    pub fn add_entity(&self, entity: EntityHandle) {
        lock(&self.queues).adds.push(entity);
    }

    /// Queue an entity for removal on the next tick
    pub fn local_destroy_entity(&self, entity: EntityHandle) {
        lock(&self.queues).removes.push(entity);
    }

    pub fn queue_entity_update(&self, entity: &SpaceEntity) {
        lock(&self.queues).queue_outgoing(entity.get_id());
    }

    /// Defer an update to the next entity tick
    pub fn mark_entity_for_update(&self, entity: &SpaceEntity) {
        lock(&self.tick_updates).push(entity.get_id());
    }

    /// Remove locally at once, then tell the server. The callback reports the server's acknowledgement.
    pub fn destroy_entity(&self, entity: &SpaceEntity, callback: CallbackHandler) {
        let removed = lock(&self.registry).remove(entity.get_id());
        match removed {
            Some(removed) => self.on_entity_removed(&removed),
            None => warn!("destroy_entity: entity {} is not registered", entity.get_id()),
        }

        let payload = match ObjectPatch::destroy(entity.get_id(), self.local_client_id()).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialise destroy patch for {}: {}", entity.get_id(), e);
                callback(false);
                return;
            }
        };

        let id = entity.get_id();
        self.session.invoke(
            SEND_OBJECT_PATCHES,
            json!([[payload]]),
            Box::new(move |result| {
                if let Err(e) = &result {
                    error!("Failed to send destroy patch for {}: {}", id, e);
                }
                callback(result.is_ok());
            }),
        );
    }

    /// Drop every entity without telling the server
    pub fn local_destroy_all_entities(&self) {
        let removed = {
            let mut registry = lock(&self.registry);
            registry.avatars.clear();
            registry.objects.clear();
            registry.selected.clear();
            std::mem::take(&mut registry.entities)
        };

        for entity in &removed {
            self.on_entity_removed(entity);
        }
        debug!("Locally destroyed {} entities", removed.len());
    }

    /// Apply queued work. See the module docs for the order.
    pub fn process_pending_entity_operations(&self) {
        let (adds, removes, incoming, outgoing, all_retrieved) = {
            let mut queues = lock(&self.queues);
            queues.outgoing_set.clear();
            (
                std::mem::take(&mut queues.adds),
                std::mem::take(&mut queues.removes),
                std::mem::take(&mut queues.incoming),
                std::mem::take(&mut queues.outgoing),
                queues.all_entities_retrieved,
            )
        };

        self.apply_adds(adds);

        if all_retrieved && !self.initial_load_complete.swap(true, Ordering::SeqCst) {
            self.on_all_entities_created();
        }

        self.apply_removes(removes);
        self.apply_incoming(incoming);
        self.flush_outgoing(outgoing);
    }

    fn apply_adds(&self, adds: Vec<EntityHandle>) {
        let mut seen = HashSet::new();
        for entity in adds {
            if !seen.insert(entity.get_id()) {
                continue;
            }
            if !self.register_entity(&entity) {
                continue;
            }
            self.on_entity_registered(&entity);

            let callback = lock(&self.callbacks).entity_created.clone();
            if let Some(callback) = callback {
                callback(&entity);
            }
        }
    }

    fn apply_removes(&self, removes: Vec<EntityHandle>) {
        let mut seen = HashSet::new();
        for entity in removes {
            if !seen.insert(entity.get_id()) {
                continue;
            }
            let removed = lock(&self.registry).remove(entity.get_id());
            match removed {
                Some(removed) => self.on_entity_removed(&removed),
                None => debug!("Pending remove of unknown entity {}", entity.get_id()),
            }
        }
    }

    fn apply_incoming(&self, incoming: VecDeque<ObjectPatch>) {
        for patch in incoming {
            let Some(entity) = self.find_space_entity_by_id(patch.id) else {
                warn!("Dropping patch for unknown entity {}", patch.id);
                continue;
            };

            if patch.destroy {
                let removed = lock(&self.registry).remove(patch.id);
                if let Some(removed) = removed {
                    self.on_entity_removed(&removed);
                    if removed.is_avatar() {
                        self.on_avatar_departed(removed.get_owner_id());
                    }
                }
                continue;
            }

            let changes = entity.apply_remote_patch(&patch);
            self.sync_selection_list(&entity);
            self.on_remote_script_change(&entity, &changes);
            entity.notify_changes(&changes);
        }
    }

    fn flush_outgoing(&self, outgoing: Vec<EntityId>) {
        let config = self.session.config();
        let local = self.local_client_id();
        let now = Instant::now();

        let mut patches = Vec::new();
        let mut flushed = Vec::new();
        let mut deferred = Vec::new();

        for id in outgoing {
            let Some(entity) = self.find_space_entity_by_id(id) else {
                debug!("Skipping update for entity {} which is no longer registered", id);
                continue;
            };

            if config.entity_patch_rate_limit_enabled && !entity.patch_window_elapsed(now, config.entity_patch_rate()) {
                deferred.push(id);
                continue;
            }

            if !entity.can_flush(local) {
                error!("Entity {} is locked or owned by another client; dropping its update", id);
                continue;
            }

            let (patch, changes) = entity.take_patch(local, now);
            match patch.to_json() {
                Ok(payload) => {
                    patches.push(payload);
                    flushed.push((entity, changes));
                }
                Err(e) => error!("Failed to serialise patch for entity {}: {}", id, e),
            }
        }

        if !deferred.is_empty() {
            let mut queues = lock(&self.queues);
            for id in deferred {
                queues.queue_outgoing(id);
            }
        }

        if patches.is_empty() {
            return;
        }

        trace!("Sending {} entity patches", patches.len());
        let acked: Vec<EntityHandle> = flushed.iter().map(|(entity, _)| entity.clone()).collect();
        self.session.invoke(
            SEND_OBJECT_PATCHES,
            json!([patches]),
            Box::new(move |result| {
                let ok = result.is_ok();
                if let Err(e) = result {
                    error!("Failed to send entity patches: {}", e);
                }
                for entity in acked {
                    entity.fire_patch_sent(ok);
                }
            }),
        );

        for (entity, changes) in flushed {
            entity.notify_changes(&changes);
        }
    }

    /// Process queues, run election and script ticks, then promote deferred updates
    pub fn tick_entities(&self) {
        self.process_pending_entity_operations();

        if let Some(election) = self.election() {
            election.update();
            if let Some(transition) = election.take_leadership_transition() {
                self.on_leadership_changed(transition);
            }
        }

        if self.entity_tick_enabled.load(Ordering::SeqCst) {
            self.tick_entity_scripts();
        }

        let marked = std::mem::take(&mut *lock(&self.tick_updates));
        if !marked.is_empty() {
            let mut queues = lock(&self.queues);
            for id in marked {
                queues.queue_outgoing(id);
            }
        }
    }

    fn tick_entity_scripts(&self) {
        let now = Instant::now();
        let delta_ms = {
            let mut last = lock(&self.last_tick);
            let delta = last.map(|l| now.saturating_duration_since(l).as_millis()).unwrap_or(0);
            *last = Some(now);
            delta
        };
        let params = json!({ "deltaTimeMS": delta_ms }).to_string();

        for entity in self.entities_snapshot() {
            let script = entity.script();
            if script.has_entity_script_component()
                && self.route_script(script.get_owner_id(), script.scope()) == ScriptRoute::Local
            {
                script.post_message_to_script(MSG_ENTITY_TICK, &params);
            }
        }
    }

    fn register_entity(&self, entity: &EntityHandle) -> bool {
        let mut registry = lock(&self.registry);
        if registry.find(entity.get_id()).is_some() {
            warn!("Entity {} is already registered; dropping duplicate add", entity.get_id());
            return false;
        }

        registry.entities.push(entity.clone());
        match entity.get_entity_type() {
            SpaceEntityType::Avatar => registry.avatars.push(entity.clone()),
            SpaceEntityType::Object => registry.objects.push(entity.clone()),
        }
        if entity.is_selected() {
            registry.selected.push(entity.clone());
        }
        true
    }

    fn on_entity_registered(&self, entity: &EntityHandle) {
        if let Some(parent_id) = entity.get_parent_id() {
            if self.find_space_entity_by_id(parent_id).is_none() {
                debug!("Entity {} references parent {} which is not known yet", entity.get_id(), parent_id);
            }
        }

        if entity.is_avatar() {
            if let Some(election) = self.election() {
                election.add_client(entity.get_owner_id());
            }
        }

        let script = entity.script();
        if self.initial_load_complete.load(Ordering::SeqCst) && script.has_entity_script_component() {
            script.register_source_as_module();
            if self.route_script(script.get_owner_id(), script.scope()) == ScriptRoute::Local {
                script.bind();
                script.invoke();
            }
        }
    }

    fn on_entity_removed(&self, entity: &EntityHandle) {
        entity.script().shutdown();

        if entity.is_avatar() {
            let owner = entity.get_owner_id();
            let still_present = lock(&self.registry).avatars.iter().any(|a| a.get_owner_id() == owner);
            if !still_present {
                if let Some(election) = self.election() {
                    election.remove_client(owner);
                }
            }
        }

        entity.fire_destroy();
        debug!("Removed entity {}", entity.get_id());
    }

    /// Release selections held by a departed client and take over its scripts
    fn on_avatar_departed(&self, client_id: ClientId) {
        let local = self.local_client_id();
        for entity in self.entities_snapshot() {
            if entity.clear_selection_of(client_id) {
                lock(&self.registry).selected.retain(|e| e.get_id() != entity.get_id());
            }

            let script = entity.script();
            let owned_by_departed = script.has_entity_script_component() && script.get_owner_id() == client_id;
            if owned_by_departed && client_id != local {
                self.claim_script_ownership(&entity);
            }
        }
    }

    fn sync_selection_list(&self, entity: &EntityHandle) {
        let mut registry = lock(&self.registry);
        let listed = registry.selected.iter().any(|e| e.get_id() == entity.get_id());
        match (entity.is_selected(), listed) {
            (true, false) => registry.selected.push(entity.clone()),
            (false, true) => registry.selected.retain(|e| e.get_id() != entity.get_id()),
            _ => {}
        }
    }

    fn on_remote_script_change(&self, entity: &EntityHandle, changes: &AppliedChanges) {
        if changes.script_source.is_none() || !self.initial_load_complete.load(Ordering::SeqCst) {
            return;
        }
        let script = entity.script();
        if self.route_script(script.get_owner_id(), script.scope()) == ScriptRoute::Local {
            script.invoke();
        }
    }

    fn on_all_entities_created(&self) {
        let entities = self.entities_snapshot();
        info!("All {} entities retrieved; starting scripts", entities.len());

        for entity in &entities {
            let script = entity.script();
            if script.has_entity_script_component() {
                script.register_source_as_module();
            }
        }

        for entity in &entities {
            let script = entity.script();
            if script.has_entity_script_component()
                && self.route_script(script.get_owner_id(), script.scope()) == ScriptRoute::Local
            {
                script.bind();
                script.invoke();
            }
        }

        for entity in &entities {
            entity.script().post_message_to_script(MSG_ENTITIES_LOADED, "{}");
        }

        self.determine_script_owners(&entities);
        self.entity_tick_enabled.store(true, Ordering::SeqCst);

        let callback = lock(&self.callbacks).initial_entities_retrieved.clone();
        if let Some(callback) = callback {
            callback(true);
        }

        match self.election() {
            None => self.fire_script_system_ready(),
            Some(election) if election.get_leader_id() != NO_CLIENT_ID => self.fire_script_system_ready(),
            Some(_) => {}
        }
    }

    /// Claim scripts whose owner is not a live client
    fn determine_script_owners(&self, entities: &[EntityHandle]) {
        let mut live: BTreeSet<ClientId> = self.entities_snapshot_avatars().iter().map(|a| a.get_owner_id()).collect();
        live.insert(self.local_client_id());

        for entity in entities {
            let script = entity.script();
            let orphaned = script.has_entity_script_component() && !live.contains(&script.get_owner_id());
            if orphaned {
                self.claim_script_ownership(entity);
            }
        }
    }

    fn on_leadership_changed(&self, transition: LeadershipTransition) {
        let local = self.local_client_id();
        info!("Leadership changed from {:?} to {:?}", transition.previous, transition.current);

        if transition.current == Some(local) && self.initial_load_complete.load(Ordering::SeqCst) {
            for entity in self.entities_snapshot() {
                let script = entity.script();
                if script.has_entity_script_component() && script.scope() == ScriptScope::Leader {
                    script.check_binding();
                    script.invoke();
                }
            }
        }

        if transition.current.is_some() && self.initial_load_complete.load(Ordering::SeqCst) {
            self.fire_script_system_ready();
        }
    }

    fn fire_script_system_ready(&self) {
        if self.script_system_ready_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = lock(&self.callbacks).script_system_ready.clone();
        if let Some(callback) = callback {
            callback(true);
        }
    }

    /// Page through every scoped entity, queueing each for the next tick
    pub fn retrieve_all_entities(&self) {
        self.retrieve_page(0);
    }

    fn retrieve_page(&self, skip: u64) {
        let token = self.session.cancellation_token();
        if token.is_cancelled() {
            debug!("Entity retrieval cancelled");
            return;
        }

        let limit = self.session.config().entity_page_limit();
        let weak = self.self_ref.clone();
        self.session.invoke(
            PAGE_SCOPED_OBJECTS,
            json!([true, true, skip, limit]),
            Box::new(move |result| {
                let Some(system) = weak.upgrade() else {
                    return;
                };

                let page = result.map_err(MultiplayerError::from).and_then(parse_page);
                let (items, total) = match page {
                    Ok(page) => page,
                    Err(e) => {
                        error!("Failed to retrieve entities: {}", e);
                        system.mark_all_entities_retrieved();
                        return;
                    }
                };

                let fetched = skip + items.len() as u64;
                for item in items {
                    system.add_entity_from_json(item);
                }

                if fetched < total && fetched > skip && !token.is_cancelled() {
                    system.retrieve_page(fetched);
                } else {
                    debug!("Retrieved {} of {} entities", fetched, total);
                    system.mark_all_entities_retrieved();
                }
            }),
        );
    }

    fn mark_all_entities_retrieved(&self) {
        lock(&self.queues).all_entities_retrieved = true;
    }

    fn add_entity_from_json(&self, payload: Value) {
        match ObjectMessage::from_json(payload) {
            Ok(message) => {
                let entity = SpaceEntity::from_message(&message, self.self_ref.clone(), self.runner.clone());
                self.add_entity(Arc::new(entity));
            }
            Err(e) => error!("Dropping undecodable entity: {}", e),
        }
    }

    fn on_object_message(&self, args: Value) {
        match first_arg(args) {
            Some(payload) => self.add_entity_from_json(payload),
            None => warn!("OnObjectMessage without a payload"),
        }
    }

    fn on_object_patch(&self, args: Value) {
        let Some(payload) = first_arg(args) else {
            warn!("OnObjectPatch without a payload");
            return;
        };
        match ObjectPatch::from_json(payload) {
            Ok(patch) => lock(&self.queues).incoming.push_back(patch),
            Err(e) => error!("Dropping undecodable patch: {}", e),
        }
    }

    fn on_request_to_send_object(&self, args: Value) {
        let Some(id) = first_arg(args).as_ref().and_then(parse_u64) else {
            warn!("OnRequestToSendObject without an id");
            return;
        };

        let snapshot = self
            .find_space_entity_by_id(id)
            .map(|entity| entity.to_object_message().to_json());

        match snapshot {
            Some(Ok(payload)) => self.session.invoke(
                SEND_OBJECT_MESSAGE,
                json!([[payload]]),
                Box::new(move |result| {
                    if let Err(e) = result {
                        error!("Failed to send requested entity {}: {}", id, e);
                    }
                }),
            ),
            Some(Err(e)) => error!("Failed to serialise requested entity {}: {}", id, e),
            None => self.session.invoke(
                SEND_OBJECT_NOT_FOUND,
                json!([id]),
                Box::new(move |result| {
                    if let Err(e) = result {
                        error!("Failed to report missing entity {}: {}", id, e);
                    }
                }),
            ),
        }
    }

    pub(crate) fn on_connect(&self) {
        if let Some(election) = self.election() {
            election.on_connect();
        }
    }

    /// Drop all session state so the next connection starts clean
    pub(crate) fn on_disconnect(&self) {
        self.local_destroy_all_entities();
        *lock(&self.queues) = PendingQueues::default();
        lock(&self.tick_updates).clear();
        *lock(&self.last_tick) = None;

        self.initial_load_complete.store(false, Ordering::SeqCst);
        self.script_system_ready_fired.store(false, Ordering::SeqCst);
        self.entity_tick_enabled.store(false, Ordering::SeqCst);

        if let Some(election) = self.election() {
            election.on_disconnect();
        }
    }

    /// Exclusive selection. Returns false, changing nothing, when the rule is violated.
    pub fn set_selection_state_of_entity(&self, selected: bool, entity: &SpaceEntity) -> bool {
        let local = self.local_client_id();
        let changed = {
            let mut registry = lock(&self.registry);
            if !entity.try_set_selected(selected, local) {
                return false;
            }
            let id = entity.get_id();
            if selected {
                if let Some(handle) = registry.find(id).cloned() {
                    registry.selected.push(handle);
                }
            } else {
                registry.selected.retain(|e| e.get_id() != id);
            }
            true
        };

        self.queue_entity_update(entity);
        changed
    }

    pub fn get_selected_entities(&self) -> Vec<EntityHandle> {
        lock(&self.registry).selected.clone()
    }

    pub fn enable_leader_election(&self) {
        let election = {
            let mut slot = lock(&self.election);
            if slot.is_some() {
                return;
            }
            let election = ClientElectionManager::new(self.session.clone(), self.event_bus.clone(), self.runner.clone());
            *slot = Some(election.clone());
            election
        };

        if self.session.is_connected() {
            election.on_connect();
        }
        for avatar in self.entities_snapshot_avatars() {
            election.add_client(avatar.get_owner_id());
        }
        info!("Leader election enabled");
    }

    pub fn disable_leader_election(&self) {
        if let Some(election) = lock(&self.election).take() {
            election.shutdown();
            info!("Leader election disabled");
        }
    }

    pub fn is_leader_election_enabled(&self) -> bool {
        lock(&self.election).is_some()
    }

    /// Current leader, 0 when none or when election is disabled
    pub fn get_leader_id(&self) -> ClientId {
        self.election().map(|e| e.get_leader_id()).unwrap_or(NO_CLIENT_ID)
    }

    pub fn get_election_manager(&self) -> Option<Arc<ClientElectionManager>> {
        self.election()
    }

    /// Without election every client runs scripts; with it only the leader does
    pub fn check_if_we_should_run_scripts_locally(&self) -> bool {
        match self.election() {
            Some(election) => election.is_local_client_leader(),
            None => true,
        }
    }

    /// Make the local client the script owner and replicate the change
    pub fn claim_script_ownership(&self, entity: &SpaceEntity) {
        if entity.set_script_owner(self.local_client_id()) {
            debug!("Claimed script ownership of entity {}", entity.get_id());
            self.queue_entity_update(entity);
        }
    }

    /// Hold off the tick while reading the registry
    pub fn lock_entity_update(&self) -> EntityRegistryGuard<'_> {
        EntityRegistryGuard(lock(&self.registry))
    }

    pub fn find_space_entity(&self, name: &str) -> Option<EntityHandle> {
        lock(&self.registry).entities.iter().find(|e| e.get_name() == name).cloned()
    }

    pub fn find_space_entity_by_id(&self, id: EntityId) -> Option<EntityHandle> {
        lock(&self.registry).find(id).cloned()
    }

    pub fn find_space_avatar(&self, name: &str) -> Option<EntityHandle> {
        lock(&self.registry).avatars.iter().find(|e| e.get_name() == name).cloned()
    }

    pub fn find_space_object(&self, name: &str) -> Option<EntityHandle> {
        lock(&self.registry).objects.iter().find(|e| e.get_name() == name).cloned()
    }

    pub fn get_num_entities(&self) -> usize {
        lock(&self.registry).entities.len()
    }

    pub fn get_num_avatars(&self) -> usize {
        lock(&self.registry).avatars.len()
    }

    pub fn get_num_objects(&self) -> usize {
        lock(&self.registry).objects.len()
    }

    pub fn get_entity_by_index(&self, index: usize) -> Option<EntityHandle> {
        lock(&self.registry).entities.get(index).cloned()
    }

    pub fn get_avatar_by_index(&self, index: usize) -> Option<EntityHandle> {
        lock(&self.registry).avatars.get(index).cloned()
    }

    pub fn get_object_by_index(&self, index: usize) -> Option<EntityHandle> {
        lock(&self.registry).objects.get(index).cloned()
    }

    /// Entities without a parent
    pub fn get_root_hierarchy_entities(&self) -> Vec<EntityHandle> {
        lock(&self.registry)
            .entities
            .iter()
            .filter(|e| e.get_parent_id().is_none())
            .cloned()
            .collect()
    }

    fn entities_snapshot(&self) -> Vec<EntityHandle> {
        lock(&self.registry).entities.clone()
    }

    fn entities_snapshot_avatars(&self) -> Vec<EntityHandle> {
        lock(&self.registry).avatars.clone()
    }
}

impl ScriptHost for SpaceEntitySystem {
    fn route_script(&self, owner_id: ClientId, scope: ScriptScope) -> ScriptRoute {
        let local = self.local_client_id();
        match (self.election(), scope) {
            (Some(election), ScriptScope::Leader) if election.is_local_client_leader() => ScriptRoute::Local,
            (Some(_), ScriptScope::Leader) => ScriptRoute::Leader,
            _ if owner_id == local || owner_id == NO_CLIENT_ID => ScriptRoute::Local,
            _ => ScriptRoute::Skip,
        }
    }

    fn run_script_remotely(&self, context_id: i64, script: &str) {
        match self.election() {
            Some(election) => election.run_script_on_leader(context_id, script),
            None => warn!("run_script_remotely: leader election is disabled"),
        }
    }
}

fn first_arg(args: Value) -> Option<Value> {
    match args {
        Value::Array(mut items) if !items.is_empty() => Some(items.swap_remove(0)),
        _ => None,
    }
}

/// Split a `PageScopedObjects` result into its items and the total count
fn parse_page(value: Value) -> MultiplayerResult<(Vec<Value>, u64)> {
    let unexpected = |v: &Value| MultiplayerError::UnexpectedResponse(format!("entity page: {}", v));
    let mut parts = match value {
        Value::Array(parts) if parts.len() == 2 => parts,
        other => return Err(unexpected(&other)),
    };

    let total = parts[1].as_u64().ok_or_else(|| unexpected(&parts[1]))?;
    match parts.swap_remove(0) {
        Value::Array(items) => Ok((items, total)),
        other => Err(unexpected(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_result_is_split() {
        let (items, total) = parse_page(json!([[{"a": 1}, {"b": 2}], 7])).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(total, 7);
        assert!(parse_page(json!([1, 2])).is_err());
        assert!(parse_page(json!({})).is_err());
    }

    #[test]
    fn first_arg_takes_head_of_array() {
        assert_eq!(first_arg(json!([5, 6])), Some(json!(5)));
        assert_eq!(first_arg(json!([])), None);
        assert_eq!(first_arg(json!("x")), None);
    }
}
