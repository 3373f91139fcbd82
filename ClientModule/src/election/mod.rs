//! # Client Election
//!
//! Deterministic leader election over the set of live clients. Every client
//! computes the same leader from the same membership: the lowest client id.
//!
//! Membership is the local client plus the owners of known avatars, and nothing
//! else changes it. A leader notification that disagrees with the local result
//! only schedules a recompute on the next `update()`; a stale notification from a
//! client that already left can never bring it back.

use log::{debug, error, info, warn};
use spaces_shared::constants::network::{CLIENT_ELECTION_MESSAGE, NO_CLIENT_ID, REMOTE_RUN_SCRIPT_MESSAGE};
use spaces_shared::types::ClientId;
use spaces_shared::value::ReplicatedValue;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use crate::lock;
use crate::net::event_bus::NetworkEventBus;
use crate::net::session::Session;
use crate::script::ScriptRunner;

/// Election message kind announcing the sender as leader
pub const NOTIFY_LEADER: i64 = 3;

/// The leader for a membership set
pub fn compute_leader(clients: &BTreeSet<ClientId>) -> Option<ClientId> {
    clients.iter().next().copied()
}

/// Leadership change not yet handled by the entity system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadershipTransition {
    pub previous: Option<ClientId>,
    pub current: Option<ClientId>,
}

#[derive(Default)]
struct ElectionState {
    clients: BTreeSet<ClientId>,
    leader: Option<ClientId>,
    recompute_requested: bool,
    pending_transition: Option<LeadershipTransition>,
}

pub struct ClientElectionManager {
    session: Arc<Session>,
    event_bus: Arc<NetworkEventBus>,
    runner: Arc<dyn ScriptRunner>,
    state: Mutex<ElectionState>,
}

impl ClientElectionManager {
    pub(crate) fn new(session: Arc<Session>, event_bus: Arc<NetworkEventBus>, runner: Arc<dyn ScriptRunner>) -> Arc<Self> {
        let manager = Arc::new(Self { session, event_bus, runner, state: Mutex::new(ElectionState::default()) });

        let weak = Arc::downgrade(&manager);
        manager.event_bus.listen_network_event(
            CLIENT_ELECTION_MESSAGE,
            Arc::new(move |ok, args| with_manager(&weak, |m| m.on_election_event(ok, args))),
        );
        let weak = Arc::downgrade(&manager);
        manager.event_bus.listen_network_event(
            REMOTE_RUN_SCRIPT_MESSAGE,
            Arc::new(move |ok, args| with_manager(&weak, |m| m.on_remote_run_script_event(ok, args))),
        );

        manager
    }

    pub(crate) fn shutdown(&self) {
        self.event_bus.stop_listen_network_event(CLIENT_ELECTION_MESSAGE);
        self.event_bus.stop_listen_network_event(REMOTE_RUN_SCRIPT_MESSAGE);
    }

    /// Start a session with the local client as the first member
    pub fn on_connect(&self) {
        let local = self.session.client_id();
        debug!("ClientElectionManager::on_connect local client {}", local);
        self.add_client(local);
    }

    /// Forget all members and assume non-leadership
    pub fn on_disconnect(&self) {
        let mut state = lock(&self.state);
        *state = ElectionState::default();
    }

    pub fn add_client(&self, client_id: ClientId) {
        let inserted = lock(&self.state).clients.insert(client_id);
        if inserted {
            debug!("Election: client {} joined", client_id);
            self.recompute();
        }
    }

    pub fn remove_client(&self, client_id: ClientId) {
        let removed = lock(&self.state).clients.remove(&client_id);
        if removed {
            debug!("Election: client {} left", client_id);
            self.recompute();
        }
    }

    pub fn get_clients(&self) -> BTreeSet<ClientId> {
        lock(&self.state).clients.clone()
    }

    /// Run a recompute requested by a disagreeing notification
    pub fn update(&self) {
        let requested = std::mem::take(&mut lock(&self.state).recompute_requested);
        if requested {
            self.recompute();
        }
    }

    /// Current leader, 0 when none
    pub fn get_leader_id(&self) -> ClientId {
        lock(&self.state).leader.unwrap_or(NO_CLIENT_ID)
    }

    pub fn is_local_client_leader(&self) -> bool {
        let local = self.session.client_id();
        lock(&self.state).leader == Some(local)
    }

    pub(crate) fn take_leadership_transition(&self) -> Option<LeadershipTransition> {
        lock(&self.state).pending_transition.take()
    }

    fn recompute(&self) {
        let local = self.session.client_id();
        let gained = {
            let mut state = lock(&self.state);
            let next = compute_leader(&state.clients);
            if next == state.leader {
                return;
            }

            let previous = match state.pending_transition.take() {
                Some(pending) => pending.previous,
                None => state.leader,
            };
            state.pending_transition = Some(LeadershipTransition { previous, current: next });
            state.leader = next;
            info!("Election: leader is now {:?}", next);
            next == Some(local)
        };

        if gained {
            self.notify_leader(local);
        }
    }

    fn notify_leader(&self, local: ClientId) {
        let args = [ReplicatedValue::Integer(NOTIFY_LEADER), ReplicatedValue::Integer(local as i64)];
        self.event_bus.send_network_event(
            CLIENT_ELECTION_MESSAGE,
            &args,
            Box::new(|code| debug!("Leader notification sent: {}", code)),
        );
    }

    fn on_election_event(&self, _ok: bool, args: &[ReplicatedValue]) {
        let parsed = match args {
            [kind, client] => kind.get_int().and_then(|k| client.get_int().map(|c| (k, c as ClientId))),
            _ => {
                warn!("Malformed client election message ({} values)", args.len());
                return;
            }
        };

        let (kind, announced) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed client election message: {}", e);
                return;
            }
        };

        if kind != NOTIFY_LEADER {
            debug!("Ignoring client election message kind {}", kind);
            return;
        }

        let mut state = lock(&self.state);
        if compute_leader(&state.clients) != Some(announced) {
            debug!("Election: client {} claims leadership; scheduling recompute", announced);
            state.recompute_requested = true;
        }
    }

    /// Send script text to the leader, which runs it in the given context
    pub fn run_script_on_leader(&self, context_id: i64, script: &str) {
        let leader = self.get_leader_id();
        if leader == NO_CLIENT_ID {
            warn!("run_script_on_leader: no leader elected");
            return;
        }

        let args = [ReplicatedValue::Integer(context_id), ReplicatedValue::from(script)];
        self.event_bus.send_network_event_to_client(
            REMOTE_RUN_SCRIPT_MESSAGE,
            &args,
            leader,
            Box::new(move |code| debug!("Remote script sent to leader {}: {}", leader, code)),
        );
    }

    fn on_remote_run_script_event(&self, _ok: bool, args: &[ReplicatedValue]) {
        if !self.is_local_client_leader() {
            error!("Received a remote script run but this client is not the leader");
            return;
        }

        let (context_id, script) = match args {
            [context, script] => match (context.get_int(), script.get_string()) {
                (Ok(context), Ok(script)) => (context, script),
                _ => {
                    warn!("Malformed remote run script message");
                    return;
                }
            },
            _ => {
                warn!("Malformed remote run script message ({} values)", args.len());
                return;
            }
        };

        if let Err(message) = self.runner.run_script(context_id, script) {
            error!("Remote script error in context {}: {}", context_id, message);
        }
    }
}

fn with_manager(weak: &Weak<ClientElectionManager>, f: impl FnOnce(&ClientElectionManager)) {
    if let Some(manager) = weak.upgrade() {
        f(&manager);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lowest_id_leads() {
        assert_eq!(compute_leader(&BTreeSet::from([7, 3, 9])), Some(3));
        assert_eq!(compute_leader(&BTreeSet::new()), None);
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(mut ids in proptest::collection::vec(1u64..10_000, 1..20)) {
            let forward: BTreeSet<_> = ids.iter().copied().collect();
            ids.reverse();
            let backward: BTreeSet<_> = ids.iter().copied().collect();
            prop_assert_eq!(compute_leader(&forward), compute_leader(&backward));
            prop_assert_eq!(compute_leader(&forward), ids.iter().copied().min());
        }
    }
}
