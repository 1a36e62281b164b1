//! Service bindings
//!
//! Every client connection to the harness interface gets a [`HarnessBinding`]
//! from the connection factory ([`RunnerHandle::create`]). Bindings hold no
//! run state of their own; all of them delegate to the one runner.

use crate::report::FinishedRun;
use crate::runner::{RunnerCommand, RunnerHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sky_harness_common::{
    DispatchOutcome, InputEvent, Result, RunPhase, RunReport, RunnerStatus, SingleTest,
};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BindingId(Uuid);

impl BindingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport bookkeeping for a binding
#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub peer: String,
    pub connected_at: DateTime<Utc>,
}

/// Registry of active bindings, owned by the runner
#[derive(Debug, Default)]
pub struct BindingSet {
    entries: HashMap<BindingId, BindingInfo>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: String) -> BindingId {
        let id = BindingId::new();
        self.entries.insert(
            id,
            BindingInfo {
                peer,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: &BindingId) -> Option<BindingInfo> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &BindingId) -> Option<&BindingInfo> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Proxy for one client connection.
///
/// Dropping the binding removes it from the runner's set; an in-flight run is
/// unaffected.
pub struct HarnessBinding {
    id: BindingId,
    runner: RunnerHandle,
}

impl HarnessBinding {
    pub(crate) fn new(id: BindingId, runner: RunnerHandle) -> Self {
        Self { id, runner }
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn set_package_root(&self, root: impl Into<String>) -> Result<()> {
        self.runner.set_package_root(root)
    }

    pub async fn start(&self, test: Option<SingleTest>) -> Result<RunPhase> {
        trace!("Binding {} requested start", self.id);
        self.runner.start(test).await
    }

    pub async fn on_test_complete(&self, result_text: String, pixels: Vec<u8>) -> Result<RunReport> {
        trace!("Binding {} reported completion", self.id);
        self.runner.on_test_complete(result_text, pixels).await
    }

    pub async fn dispatch_input_event(&self, event: InputEvent) -> Result<DispatchOutcome> {
        self.runner.dispatch_input_event(event).await
    }

    pub async fn status(&self) -> Result<RunnerStatus> {
        self.runner.status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FinishedRun> {
        self.runner.subscribe()
    }
}

impl Drop for HarnessBinding {
    fn drop(&mut self) {
        self.runner.send(RunnerCommand::Unbind { id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_set_tracks_membership() {
        let mut set = BindingSet::new();
        assert!(set.is_empty());

        let driver = set.insert("pid:100".to_string());
        let engine = set.insert("pid:200".to_string());
        assert_ne!(driver, engine);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&engine).unwrap().peer, "pid:200");

        assert!(set.remove(&driver).is_some());
        assert!(set.remove(&driver).is_none());
        assert_eq!(set.len(), 1);
    }
}
