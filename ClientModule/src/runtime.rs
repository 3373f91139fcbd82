//! # Tick Driver
//!
//! Drives `SpaceEntitySystem::tick_entities` on a tokio interval until the
//! session's cancellation token fires.

use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cancellation::CancellationToken;
use crate::entity::SpaceEntitySystem;

pub fn spawn_tick_loop(
    handle: &Handle,
    system: Arc<SpaceEntitySystem>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => system.tick_entities(),
            }
        }
        debug!("Entity tick loop stopped");
    })
}

