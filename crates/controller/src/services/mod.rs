//! Domain operations. Each mutation runs in one transaction and hands its
//! side effects to [`AfterCommit`], which applies them once the commit
//! succeeded.

use uuid::Uuid;

use crate::app_state::AppState;
use crate::events::{ConfigEvent, PendingEvents};
use crate::tasks::BackgroundTask;

pub mod compile;
pub mod configs;
pub mod controller;
pub mod devices;
pub mod organizations;
pub mod templates;
pub mod vpn;

#[cfg(test)]
pub(crate) mod test_support;

/// Side effects collected during a transaction.
#[derive(Debug, Default)]
pub struct AfterCommit {
    pub events: PendingEvents,
    pub tasks: Vec<BackgroundTask>,
    /// Configs whose cached checksum must be dropped.
    pub invalidate: Vec<Uuid>,
}

impl AfterCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&mut self, event: ConfigEvent) {
        self.events.push(event);
    }

    pub fn task(&mut self, task: BackgroundTask) {
        self.tasks.push(task);
    }

    pub fn invalidate(&mut self, config_id: Uuid) {
        if !self.invalidate.contains(&config_id) {
            self.invalidate.push(config_id);
        }
    }

    pub fn merge(&mut self, other: AfterCommit) {
        self.events.extend(other.events);
        self.tasks.extend(other.tasks);
        for id in other.invalidate {
            self.invalidate(id);
        }
    }

    /// Invalidate caches, dispatch events, then submit background tasks.
    pub async fn run(self, state: &AppState) {
        state.checksums.invalidate_many(&self.invalidate).await;
        state.events.dispatch(self.events).await;
        state.tasks.submit_all(state, self.tasks).await;
    }
}
