//! Two-phase deletion of the pods on the local node ahead of a termination.
//!
//! Pods in the reserved infrastructure namespace go last: the tail of the
//! time budget is held back for them so log shippers and their kin can flush
//! whatever the rest of the node produced while shutting down. Regular pods
//! share everything before that tail, or get no grace at all when the budget
//! is too tight to split.

use super::ExcludeSet;
use crate::cluster::ClusterApi;
use crate::constants::{EVICTION_EVENT_REASON, SYSTEM_NAMESPACE};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use snafu::ResultExt;
use tokio::time::{sleep, Duration, Instant};
use tracing::{event, Level};

use self::error::Result;

// Poll interval while waiting for a deleted pod to actually disappear.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait PodEvictor {
    /// Delete every pod assigned to the local node, except those in
    /// `exclude`, within `timeout`. Success means all delete requests were
    /// accepted; waiting for pods to vanish is best-effort.
    async fn evict_pods(&self, exclude: &ExcludeSet, timeout: Duration) -> Result<()>;
}

pub struct PodEvictionHandler<C> {
    cluster: C,
    node_name: String,
    system_pod_grace_period: Duration,
}

impl<C: ClusterApi> PodEvictionHandler<C> {
    pub fn new(cluster: C, node_name: String, system_pod_grace_period: Duration) -> Self {
        Self {
            cluster,
            node_name,
            system_pod_grace_period,
        }
    }

    async fn delete_pods(&self, pods: &[Pod], grace_period: Duration) -> Result<()> {
        for pod in pods {
            self.record_eviction_event(pod).await;
            event!(
                Level::DEBUG,
                name = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                grace_period_secs = grace_period.as_secs(),
                "requesting pod deletion"
            );
            self.cluster
                .delete_pod(
                    &pod.name_any(),
                    &pod.namespace().unwrap_or_default(),
                    grace_period,
                )
                .await
                .context(error::DeletePodSnafu {
                    name: pod.name_any(),
                    namespace: pod.namespace().unwrap_or_default(),
                })?;
        }
        // Deletion is asynchronous and pods get their grace period to exit;
        // a pod overstaying it is the provider's problem, not ours.
        for pod in pods {
            if let Err(err) = self.wait_for_pod_not_found(pod, grace_period).await {
                event!(
                    Level::WARN,
                    error = %err,
                    name = %pod.name_any(),
                    namespace = %pod.namespace().unwrap_or_default(),
                    "pod still present after its deletion grace period"
                );
            }
        }
        Ok(())
    }

    async fn wait_for_pod_not_found(&self, pod: &Pod, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .cluster
                .get_pod(&pod.name_any(), &pod.namespace().unwrap_or_default())
                .await
            {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(source) => {
                    return Err(error::Error::PodExistenceCheck {
                        source,
                        name: pod.name_any(),
                    })
                }
            }
            if Instant::now() >= deadline {
                return error::WaitForDeletionSnafu {
                    name: pod.name_any(),
                    max_wait: timeout,
                }
                .fail();
            }
            sleep(DELETION_CHECK_INTERVAL).await;
        }
    }

    async fn record_eviction_event(&self, pod: &Pod) {
        let event = Event {
            type_: EventType::Warning,
            reason: EVICTION_EVENT_REASON.to_string(),
            note: Some(format!(
                "Node {:?} is about to be terminated. Evicting pod prior to node termination.",
                self.node_name
            )),
            action: "Evict".to_string(),
            secondary: None,
        };
        if let Err(err) = self.cluster.publish_event(pod.object_ref(&()), event).await {
            event!(
                Level::WARN,
                error = %err,
                name = %pod.name_any(),
                "failed to record eviction event on pod"
            );
        }
    }
}

#[async_trait]
impl<C: ClusterApi> PodEvictor for PodEvictionHandler<C> {
    async fn evict_pods(&self, exclude: &ExcludeSet, timeout: Duration) -> Result<()> {
        let pods = self
            .cluster
            .list_pods_on_node(&self.node_name)
            .await
            .context(error::ListPodsSnafu {
                node_name: &self.node_name,
            })?;
        let (system_pods, regular_pods): (Vec<Pod>, Vec<Pod>) = pods
            .into_iter()
            .filter(|pod| {
                !exclude.contains(
                    &pod.name_any(),
                    pod.namespace().as_deref().unwrap_or_default(),
                )
            })
            .partition(|pod| pod.namespace().as_deref() == Some(SYSTEM_NAMESPACE));

        // Hold the tail of the budget back for system pods, unless the budget
        // is too small to be worth splitting.
        let regular_grace = if timeout >= self.system_pod_grace_period * 2 {
            timeout - self.system_pod_grace_period
        } else {
            Duration::ZERO
        };
        self.delete_pods(&regular_pods, regular_grace).await?;
        self.delete_pods(&system_pods, self.system_pod_grace_period)
            .await?;
        event!(
            Level::INFO,
            node_name = %self.node_name,
            "evicted all pods from node"
        );
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;
    use tokio::time::Duration;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list pods on node '{}': '{}'", node_name, source))]
        ListPods {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Unable to delete pod '{}/{}': '{}'", namespace, name, source))]
        DeletePod {
            source: kube::Error,
            name: String,
            namespace: String,
        },

        #[snafu(display("Unable to check whether pod '{}' is gone: '{}'", name, source))]
        PodExistenceCheck { source: kube::Error, name: String },

        #[snafu(display("Pod '{}' was not deleted in the time allocated ({:.2}s)", name, max_wait.as_secs_f64()))]
        WaitForDeletion { name: String, max_wait: Duration },
    }
}

#[cfg(feature = "mockall")]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock pod evictor for use in tests.
        pub PodEvictor {}

        #[async_trait]
        impl PodEvictor for PodEvictor {
            async fn evict_pods(&self, exclude: &ExcludeSet, timeout: Duration) -> Result<()>;
        }
    }
}
