//! The narrow orchestrator surface consumed by the cordon controller and the
//! eviction engine.
//!
//! Everything the agent does against the cluster goes through [`ClusterApi`]:
//! listing the pods assigned to the local node, deleting a pod with a grace
//! period, checking whether a pod still exists, reading and writing the local
//! node object, and recording events. Keeping this behind a trait lets the
//! cordon and eviction logic run against an in-memory cluster in tests.

use crate::constants::EVENT_SOURCE;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::ResourceExt;
use tokio::time::Duration;

/// Cluster calls surface raw API errors; the components wrap them with context.
pub type Result<T> = std::result::Result<T, kube::Error>;

#[async_trait]
pub trait ClusterApi: Clone + Send + Sync {
    /// All pods whose `spec.nodeName` matches the given node.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Request deletion of a pod, giving it `grace_period` to exit cleanly.
    async fn delete_pod(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Duration,
    ) -> Result<()>;

    /// The pod if it still exists, `None` once it is fully gone.
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Write back a modified node object. Subject to the API server's
    /// resource-version optimistic concurrency; conflicts surface as errors.
    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// Record an event against the referenced object. Best-effort from the
    /// callers' perspective; they log rather than propagate failures.
    async fn publish_event(&self, reference: ObjectReference, event: Event) -> Result<()>;
}

/// Production implementation over a [`kube::Client`].
#[derive(Clone)]
pub struct K8sClusterApi {
    client: kube::Client,
    reporter: Reporter,
}

impl K8sClusterApi {
    pub fn new(client: kube::Client, node_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: EVENT_SOURCE.to_string(),
                instance: Some(node_name.to_string()),
            },
        }
    }
}

#[async_trait]
impl ClusterApi for K8sClusterApi {
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        Ok(pods.list(&params).await?.items)
    }

    async fn delete_pod(
        &self,
        name: &str,
        namespace: &str,
        grace_period: Duration,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period.as_secs() as u32),
            ..Default::default()
        };
        pods.delete(name, &params).await.map(|_| ())
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get_opt(name).await
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get(name).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .replace(&node.name_any(), &PostParams::default(), node)
            .await
    }

    async fn publish_event(&self, reference: ObjectReference, event: Event) -> Result<()> {
        Recorder::new(self.client.clone(), self.reporter.clone(), reference)
            .publish(event)
            .await
    }
}

#[cfg(any(test, feature = "mockall"))]
pub mod fake {
    //! An in-memory cluster recording every mutation, in the spirit of the
    //! fake clientsets used to test client-side controllers.

    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug)]
    pub struct Deletion {
        pub name: String,
        pub namespace: String,
        pub grace_period: Duration,
    }

    #[derive(Clone, Debug)]
    pub struct RecordedEvent {
        pub reason: String,
        pub target: String,
    }

    #[derive(Default)]
    struct Inner {
        node: Node,
        pods: Vec<Pod>,
        deletions: Vec<Deletion>,
        events: Vec<RecordedEvent>,
        node_writes: u32,
        update_conflicts: u32,
        fail_deletes: bool,
        retain_deleted_pods: bool,
    }

    #[derive(Clone, Default)]
    pub struct FakeCluster {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeCluster {
        pub fn new(node_name: &str) -> Self {
            let cluster = Self::default();
            cluster.inner.lock().unwrap().node = Node {
                metadata: ObjectMeta {
                    name: Some(node_name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            cluster
        }

        pub fn add_pod(&self, name: &str, namespace: &str, node_name: &str) {
            self.inner.lock().unwrap().pods.push(Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(node_name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        pub fn node(&self) -> Node {
            self.inner.lock().unwrap().node.clone()
        }

        pub fn set_node(&self, node: Node) {
            self.inner.lock().unwrap().node = node;
        }

        /// Remaining pod identities, as `(name, namespace)`.
        pub fn pod_identities(&self) -> Vec<(String, String)> {
            self.inner
                .lock()
                .unwrap()
                .pods
                .iter()
                .map(|pod| {
                    (
                        pod.name_any(),
                        pod.namespace().unwrap_or_default(),
                    )
                })
                .collect()
        }

        /// Every accepted delete request, in order.
        pub fn deletions(&self) -> Vec<Deletion> {
            self.inner.lock().unwrap().deletions.clone()
        }

        pub fn events(&self) -> Vec<RecordedEvent> {
            self.inner.lock().unwrap().events.clone()
        }

        pub fn node_writes(&self) -> u32 {
            self.inner.lock().unwrap().node_writes
        }

        /// Make the next `count` node updates fail with a 409, as an optimistic
        /// concurrency conflict would.
        pub fn fail_updates_with_conflict(&self, count: u32) {
            self.inner.lock().unwrap().update_conflicts = count;
        }

        pub fn fail_deletes(&self) {
            self.inner.lock().unwrap().fail_deletes = true;
        }

        /// Accept deletions but keep the pods visible, as if none of them
        /// managed to exit within their grace period.
        pub fn retain_deleted_pods(&self) {
            self.inner.lock().unwrap().retain_deleted_pods = true;
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .pods
                .iter()
                .filter(|pod| {
                    pod.spec
                        .as_ref()
                        .and_then(|spec| spec.node_name.as_deref())
                        == Some(node_name)
                })
                .cloned()
                .collect())
        }

        async fn delete_pod(
            &self,
            name: &str,
            namespace: &str,
            grace_period: Duration,
        ) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_deletes {
                return Err(api_error(500, "InternalError"));
            }
            let position = inner.pods.iter().position(|pod| {
                pod.name_any() == name && pod.namespace().as_deref() == Some(namespace)
            });
            match position {
                Some(index) => {
                    inner.deletions.push(Deletion {
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                        grace_period,
                    });
                    if !inner.retain_deleted_pods {
                        inner.pods.remove(index);
                    }
                    Ok(())
                }
                None => Err(api_error(404, "NotFound")),
            }
        }

        async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .pods
                .iter()
                .find(|pod| {
                    pod.name_any() == name && pod.namespace().as_deref() == Some(namespace)
                })
                .cloned())
        }

        async fn get_node(&self, name: &str) -> Result<Node> {
            let inner = self.inner.lock().unwrap();
            if inner.node.name_any() == name {
                Ok(inner.node.clone())
            } else {
                Err(api_error(404, "NotFound"))
            }
        }

        async fn update_node(&self, node: &Node) -> Result<Node> {
            let mut inner = self.inner.lock().unwrap();
            if inner.update_conflicts > 0 {
                inner.update_conflicts -= 1;
                return Err(api_error(409, "Conflict"));
            }
            inner.node = node.clone();
            inner.node_writes += 1;
            Ok(node.clone())
        }

        async fn publish_event(&self, reference: ObjectReference, event: Event) -> Result<()> {
            self.inner.lock().unwrap().events.push(RecordedEvent {
                reason: event.reason,
                target: reference.name.unwrap_or_default(),
            });
            Ok(())
        }
    }
}
