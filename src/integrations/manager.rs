//! Supervisor owning every running integration
//!
//! Builds adapters from the configured descriptors, opens one broker
//! session per integration, runs all `init` calls concurrently and tears
//! everything down again on shutdown. A failing adapter never takes the
//! others with it.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::loader::{IntegrationDescriptor, Registry};
use super::{Integration, IntegrationRuntime};
use crate::mqtt::{ConnectionSession, InboundMessage, MqttConfig, SessionHandle};
use crate::persistence::StateStore;

const FAILED_CLOSE_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStatus {
    Starting,
    Running,
    Failed(String),
}

struct Member {
    id: String,
    runtime: IntegrationRuntime,
    adapter: Arc<dyn Integration>,
    status: IntegrationStatus,
    dispatch: JoinHandle<()>,
}

pub struct IntegrationSupervisor {
    registry: Registry,
    mqtt: MqttConfig,
    device_id: String,
    store: StateStore,
    members: Vec<Member>,
}

impl IntegrationSupervisor {
    pub fn new(registry: Registry, mqtt: MqttConfig, device_id: &str, store: StateStore) -> Self {
        Self {
            registry,
            mqtt,
            device_id: device_id.to_string(),
            store,
            members: Vec::new(),
        }
    }

    /// Builds, connects and initializes every descriptor.
    ///
    /// Descriptors naming an unknown module are logged and skipped.
    pub async fn start(&mut self, descriptors: &[IntegrationDescriptor]) {
        for descriptor in descriptors {
            let adapter = match self.registry.build(descriptor) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!("Skipping integration {}: {}", descriptor.id, e);
                    continue;
                }
            };
            let (session, inbound) =
                ConnectionSession::spawn(&self.mqtt, &self.device_id, adapter.canonical_name());
            self.attach(descriptor, adapter, session, inbound);
        }
        self.init_all().await;
    }

    /// Adds an integration on an existing session and starts delivering
    /// its inbound messages. `init` is not called yet.
    pub fn attach(
        &mut self,
        descriptor: &IntegrationDescriptor,
        adapter: Arc<dyn Integration>,
        session: SessionHandle,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let runtime = IntegrationRuntime::new(
            &descriptor.id,
            adapter.canonical_name(),
            &self.device_id,
            descriptor.config.clone(),
            session,
            self.store.clone(),
        );
        let dispatch = runtime.spawn_dispatch(adapter.clone(), inbound);
        self.members.push(Member {
            id: descriptor.id.clone(),
            runtime,
            adapter,
            status: IntegrationStatus::Starting,
            dispatch,
        });
    }

    /// Runs `init` of every attached integration that is still starting.
    ///
    /// Each init runs in its own task so an error or a panic only marks
    /// that integration as failed. A failed integration is not retried;
    /// its routes are dropped and its session closed without presence,
    /// since the device itself is still online.
    pub async fn init_all(&mut self) {
        let pending: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.status == IntegrationStatus::Starting)
            .map(|(i, _)| i)
            .collect();

        let tasks = pending.iter().map(|&i| {
            let member = &self.members[i];
            let runtime = member.runtime.clone();
            let adapter = member.adapter.clone();
            let span = info_span!("integration", id = %member.id, name = adapter.canonical_name());
            tokio::spawn(async move { adapter.init(&runtime).await }.instrument(span))
        });
        let outcomes = join_all(tasks).await;

        let mut failed = Vec::new();
        for (i, outcome) in pending.into_iter().zip(outcomes) {
            let member = &mut self.members[i];
            member.status = match outcome {
                Ok(Ok(())) => {
                    info!("Integration {} running", member.id);
                    IntegrationStatus::Running
                }
                Ok(Err(e)) => {
                    error!("Integration {} failed to initialize: {}", member.id, e);
                    failed.push(i);
                    IntegrationStatus::Failed(e.to_string())
                }
                Err(e) => {
                    error!("Integration {} panicked during init", member.id);
                    failed.push(i);
                    IntegrationStatus::Failed(format!("init panicked: {}", e))
                }
            };
        }

        for i in failed {
            let member = &self.members[i];
            member.dispatch.abort();
            member.runtime.routes().clear();
            if let Err(e) = member.runtime.session().close(FAILED_CLOSE_DEADLINE).await {
                warn!("Error closing session of {}: {}", member.id, e);
            }
        }
    }

    pub fn statuses(&self) -> Vec<(String, IntegrationStatus)> {
        self.members
            .iter()
            .map(|m| (m.id.clone(), m.status.clone()))
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<IntegrationStatus> {
        self.member(id).map(|m| m.status.clone())
    }

    pub fn runtime(&self, id: &str) -> Option<&IntegrationRuntime> {
        self.member(id).map(|m| &m.runtime)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Destroys every integration that did not fail and closes its session, all
    /// in parallel and each bounded by `deadline`.
    pub async fn shutdown(&mut self, deadline: Duration) {
        info!("Shutting down {} integration(s)", self.members.len());
        let members = std::mem::take(&mut self.members);
        let teardowns = members.iter().map(|member| {
            let span = info_span!("integration", id = %member.id, name = member.adapter.canonical_name());
            async move {
                if !matches!(member.status, IntegrationStatus::Failed(_)) {
                    member.runtime.teardown(member.adapter.as_ref(), deadline).await;
                }
                member.dispatch.abort();
            }
            .instrument(span)
        });
        join_all(teardowns).await;

        for member in &members {
            if !member.runtime.session().is_stopped() {
                warn!("Session of {} still open after shutdown", member.id);
            }
        }
    }

    fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }
}
