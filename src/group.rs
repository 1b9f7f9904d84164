//! Process groups: sets of mutually exclusive processes in one swap domain.

use crate::process::{Process, ProcessState, StopStrategy};
use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::future::join_all;
use std::collections::HashMap;
use tracing::info;

use crate::process::ProcessError;

pub struct ProcessGroup {
    id: String,
    swap: bool,
    exclusive: bool,
    processes: HashMap<String, Process>,
}

impl ProcessGroup {
    pub fn new(id: &str, swap: bool, exclusive: bool, members: Vec<Process>) -> Self {
        let processes = members
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();
        ProcessGroup {
            id: id.to_string(),
            swap,
            exclusive,
            processes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn swap(&self) -> bool {
        self.swap
    }

    pub fn has_member(&self, model_id: &str) -> bool {
        self.processes.contains_key(model_id)
    }

    pub fn member(&self, model_id: &str) -> Option<&Process> {
        self.processes.get(model_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Start the member if needed (engaging the scheduler through its
    /// pre-start hook) and proxy the request to it. In a swap group, other
    /// members are stopped first so at most one is ever ready.
    pub async fn proxy_request(
        &self,
        model_id: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProcessError> {
        let process = self
            .processes
            .get(model_id)
            .ok_or(ProcessError::NotReady)?;
        self.swap_in(process).await;
        process.proxy_request(request).await
    }

    /// Start a member without proxying (administrative load).
    pub async fn ensure_started(&self, model_id: &str) -> Result<(), ProcessError> {
        let process = self
            .processes
            .get(model_id)
            .ok_or(ProcessError::NotReady)?;
        self.swap_in(process).await;
        process.start().await
    }

    async fn swap_in(&self, target: &Process) {
        if !self.swap || target.state() == ProcessState::Ready {
            return;
        }
        let competitors: Vec<&Process> = self
            .processes
            .values()
            .filter(|p| {
                p.id() != target.id()
                    && matches!(
                        p.state(),
                        ProcessState::Ready | ProcessState::Starting | ProcessState::Stopping
                    )
            })
            .collect();
        if competitors.is_empty() {
            return;
        }
        info!(
            group = %self.id,
            target = %target.id(),
            stopping = competitors.len(),
            "Swapping group member"
        );
        join_all(competitors.iter().map(|p| p.stop_immediately())).await;
    }

    pub async fn stop_all(&self, strategy: StopStrategy) {
        join_all(self.processes.values().map(|p| p.stop_with(strategy))).await;
    }

    pub async fn shutdown(&self) {
        join_all(self.processes.values().map(|p| p.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogStdout, ModelConfig};
    use crate::events::EventBus;
    use crate::logbuffer::LogBuffer;
    use crate::memory::MemoryTracker;
    use std::sync::Arc;
    use std::time::Duration;

    fn member(id: &str) -> Process {
        Process::new(
            id,
            ModelConfig {
                cmd: format!("{id}-server --port 9000"),
                proxy_url: "http://localhost:9000".to_string(),
                check_endpoint: "/health".to_string(),
                ..ModelConfig::default()
            },
            Duration::from_secs(1),
            LogStdout::Off,
            Arc::new(MemoryTracker::new()),
            EventBus::new(16),
            Arc::new(LogBuffer::new(16)),
        )
    }

    #[test]
    fn membership_lookup() {
        let group = ProcessGroup::new("g", true, true, vec![member("a"), member("b")]);
        assert!(group.has_member("a"));
        assert!(group.has_member("b"));
        assert!(!group.has_member("c"));
        assert_eq!(group.member("a").unwrap().id(), "a");
    }

    #[tokio::test]
    async fn swap_group_stops_competitors() {
        let a = member("a");
        let b = member("b");
        a.force_state(ProcessState::Ready);
        let group = ProcessGroup::new("g", true, true, vec![a.clone(), b.clone()]);

        group.swap_in(&b).await;
        assert_eq!(a.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn non_swap_group_leaves_competitors_alone() {
        let a = member("a");
        let b = member("b");
        a.force_state(ProcessState::Ready);
        let group = ProcessGroup::new("g", false, false, vec![a.clone(), b.clone()]);

        group.swap_in(&b).await;
        assert_eq!(a.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn swap_in_is_a_noop_when_target_already_ready() {
        let a = member("a");
        let b = member("b");
        a.force_state(ProcessState::Ready);
        b.force_state(ProcessState::Ready);
        let group = ProcessGroup::new("g", true, true, vec![a.clone(), b.clone()]);

        // Target already ready: nothing is stopped (the invariant was
        // already maintained by whoever made both ready).
        group.swap_in(&a).await;
        assert_eq!(b.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn stop_all_reaches_every_member() {
        let a = member("a");
        let b = member("b");
        a.force_state(ProcessState::Ready);
        b.force_state(ProcessState::Ready);
        let group = ProcessGroup::new("g", true, true, vec![a.clone(), b.clone()]);

        group.stop_all(StopStrategy::Immediate).await;
        assert_eq!(a.state(), ProcessState::Stopped);
        assert_eq!(b.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_is_terminal_for_all_members() {
        let a = member("a");
        let b = member("b");
        let group = ProcessGroup::new("g", true, true, vec![a.clone(), b.clone()]);

        group.shutdown().await;
        assert_eq!(a.state(), ProcessState::Shutdown);
        assert_eq!(b.state(), ProcessState::Shutdown);
        assert!(group.ensure_started("a").await.is_err());
    }
}
