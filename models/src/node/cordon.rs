//! Marks the local node unschedulable ahead of a termination, and clears the
//! marking once the threat passes.
//!
//! One of two backends is active: a taint placed on the node's taint list, or
//! an annotation whose value tracks the cordon as `"true"`/`"false"`. Both
//! operations are read-modify-write against the node object and only write
//! when something actually changes, so repeated applications are cheap and
//! emit at most one event.

use crate::cluster::ClusterApi;
use crate::constants::{CORDON_EVENT_REASON, UNCORDON_EVENT_REASON};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::runtime::events::{Event, EventType};
use kube::Resource;
use snafu::ResultExt;
use std::fmt;
use std::str::FromStr;
use tracing::{event, Level};

use self::error::Result;

/// Scheduling effect carried by the configured taint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaintEffect {
    /// New pods without a toleration are not scheduled; running pods stay.
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaintEffect {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            _ => error::UnknownTaintEffectSnafu { value: s }.fail(),
        }
    }
}

/// The `key:value:effect` triple placed on the node while a termination is
/// being handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaintConfig {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl TaintConfig {
    fn as_taint(&self) -> Taint {
        Taint {
            key: self.key.clone(),
            value: (!self.value.is_empty()).then(|| self.value.clone()),
            effect: self.effect.to_string(),
            time_added: None,
        }
    }
}

impl FromStr for TaintConfig {
    type Err = error::Error;

    /// Parses `key:value:effect`. The value may be empty
    /// (`example.com/impending-termination::NoSchedule`), but all three parts
    /// must be present.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [key, value, effect] if !key.is_empty() => Ok(Self {
                key: key.to_string(),
                value: value.to_string(),
                effect: effect.parse()?,
            }),
            _ => error::MalformedTaintSnafu { value: s }.fail(),
        }
    }
}

/// How the node is marked unschedulable. Exactly one backend is configured.
#[derive(Clone, Debug)]
pub enum CordonBackend {
    Taint(TaintConfig),
    /// Annotation key whose value is `"true"` while cordoned.
    Annotation(String),
}

#[async_trait]
pub trait CordonHandler {
    /// Mark the node unschedulable. Idempotent; writes and records an event
    /// only when the node actually changes.
    async fn apply(&self) -> Result<()>;

    /// Reverse the unschedulable marking.
    async fn remove(&self) -> Result<()>;
}

pub struct NodeCordonHandler<C> {
    cluster: C,
    node_name: String,
    backend: CordonBackend,
}

impl<C: ClusterApi> NodeCordonHandler<C> {
    pub fn new(cluster: C, node_name: String, backend: CordonBackend) -> Self {
        Self {
            cluster,
            node_name,
            backend,
        }
    }

    async fn record_node_event(&self, node: &Node, type_: EventType, reason: &str, note: &str) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Cordon".to_string(),
            secondary: None,
        };
        if let Err(err) = self.cluster.publish_event(node.object_ref(&()), event).await {
            event!(
                Level::WARN,
                error = %err,
                node_name = %self.node_name,
                "failed to record event on node"
            );
        }
    }
}

#[async_trait]
impl<C: ClusterApi> CordonHandler for NodeCordonHandler<C> {
    async fn apply(&self) -> Result<()> {
        let node = self
            .cluster
            .get_node(&self.node_name)
            .await
            .context(error::GetNodeSnafu {
                node_name: &self.node_name,
            })?;
        let (node, updated) = match &self.backend {
            CordonBackend::Taint(taint) => add_or_update_taint(node, &taint.as_taint()),
            CordonBackend::Annotation(key) => set_annotation(node, key, "true"),
        };
        if updated {
            self.cluster
                .update_node(&node)
                .await
                .context(error::UpdateNodeSnafu {
                    node_name: &self.node_name,
                })?;
            event!(Level::INFO, node_name = %self.node_name, "marked node unschedulable");
            self.record_node_event(
                &node,
                EventType::Warning,
                CORDON_EVENT_REASON,
                "Node is about to be terminated. Marking the node to prevent further pods from being scheduled on it.",
            )
            .await;
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let node = self
            .cluster
            .get_node(&self.node_name)
            .await
            .context(error::GetNodeSnafu {
                node_name: &self.node_name,
            })?;
        let (node, updated) = match &self.backend {
            CordonBackend::Taint(taint) => remove_taint(node, &taint.as_taint()),
            CordonBackend::Annotation(key) => set_annotation(node, key, "false"),
        };
        if updated {
            self.cluster
                .update_node(&node)
                .await
                .context(error::UpdateNodeSnafu {
                    node_name: &self.node_name,
                })?;
            event!(Level::INFO, node_name = %self.node_name, "cleared unschedulable marking");
            self.record_node_event(
                &node,
                EventType::Normal,
                UNCORDON_EVENT_REASON,
                "Removing impending termination marking from the node.",
            )
            .await;
        }
        Ok(())
    }
}

/// Key and effect identify the taint slot a configured taint occupies.
fn taints_match(a: &Taint, b: &Taint) -> bool {
    a.key == b.key && a.effect == b.effect
}

/// Semantic equality on the key/value/effect triple. A missing value and an
/// empty value are the same thing; bookkeeping fields do not participate.
fn taints_equal(a: &Taint, b: &Taint) -> bool {
    taints_match(a, b)
        && a.value.as_deref().unwrap_or_default() == b.value.as_deref().unwrap_or_default()
}

/// Returns the node with `taint` added or updated, and whether anything
/// changed. A deep-equal taint leaves the node untouched; a matching taint
/// with a different value is replaced in place. Existing order is preserved
/// and a new taint is appended.
fn add_or_update_taint(mut node: Node, taint: &Taint) -> (Node, bool) {
    let spec = node.spec.get_or_insert_with(Default::default);
    let current = spec.taints.take().unwrap_or_default();
    let mut new_taints = Vec::with_capacity(current.len() + 1);
    let mut updated = false;
    for existing in &current {
        if taints_match(existing, taint) {
            if taints_equal(existing, taint) {
                spec.taints = Some(current);
                return (node, false);
            }
            new_taints.push(taint.clone());
            updated = true;
            continue;
        }
        new_taints.push(existing.clone());
    }
    if !updated {
        new_taints.push(taint.clone());
    }
    spec.taints = Some(new_taints);
    (node, true)
}

/// Strips every taint matching `taint`'s key and effect, regardless of value.
fn remove_taint(mut node: Node, taint: &Taint) -> (Node, bool) {
    let Some(spec) = node.spec.as_mut() else {
        return (node, false);
    };
    let Some(current) = spec.taints.take() else {
        return (node, false);
    };
    let remaining: Vec<Taint> = current
        .iter()
        .filter(|existing| !taints_match(existing, taint))
        .cloned()
        .collect();
    let updated = remaining.len() != current.len();
    spec.taints = Some(remaining);
    (node, updated)
}

fn set_annotation(mut node: Node, key: &str, value: &str) -> (Node, bool) {
    let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
    let updated = annotations.get(key).map(String::as_str) != Some(value);
    if updated {
        annotations.insert(key.to_string(), value.to_string());
    }
    (node, updated)
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read node '{}': '{}'", node_name, source))]
        GetNode {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Unable to update node '{}': '{}'", node_name, source))]
        UpdateNode {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display(
            "Invalid taint '{}'. Expected format 'key:value:effect'.",
            value
        ))]
        MalformedTaint { value: String },

        #[snafu(display("Unknown taint effect '{}'", value))]
        UnknownTaintEffect { value: String },
    }
}

#[cfg(feature = "mockall")]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock cordon handler for use in tests.
        pub CordonHandler {}

        #[async_trait]
        impl CordonHandler for CordonHandler {
            async fn apply(&self) -> Result<()>;
            async fn remove(&self) -> Result<()>;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::constants::{CORDON_EVENT_REASON, UNCORDON_EVENT_REASON};

    const NODE: &str = "localhost";

    fn configured_taint() -> TaintConfig {
        "example.com/impending-termination:pending:NoSchedule"
            .parse()
            .unwrap()
    }

    fn taint_handler(cluster: FakeCluster) -> NodeCordonHandler<FakeCluster> {
        NodeCordonHandler::new(
            cluster,
            NODE.to_string(),
            CordonBackend::Taint(configured_taint()),
        )
    }

    fn node_taints(cluster: &FakeCluster) -> Vec<Taint> {
        cluster
            .node()
            .spec
            .and_then(|spec| spec.taints)
            .unwrap_or_default()
    }

    #[test]
    fn taint_parsing() {
        let taint: TaintConfig = "example.com/term:pending:NoExecute".parse().unwrap();
        assert_eq!(taint.key, "example.com/term");
        assert_eq!(taint.value, "pending");
        assert_eq!(taint.effect, TaintEffect::NoExecute);

        // Empty values are legal; missing parts and unknown effects are not.
        assert!("example.com/term::NoSchedule".parse::<TaintConfig>().is_ok());
        assert!("example.com/term:NoSchedule".parse::<TaintConfig>().is_err());
        assert!(":v:NoSchedule".parse::<TaintConfig>().is_err());
        assert!("k:v:Sometimes".parse::<TaintConfig>().is_err());
    }

    #[test]
    fn add_or_update_preserves_existing_order() {
        let other = Taint {
            key: "other".to_string(),
            value: None,
            effect: "NoExecute".to_string(),
            time_added: None,
        };
        let mut node = Node::default();
        node.spec.get_or_insert_with(Default::default).taints = Some(vec![other.clone()]);

        let (node, updated) = add_or_update_taint(node, &configured_taint().as_taint());
        assert!(updated);
        let taints = node.spec.unwrap().taints.unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[0].key, "other");
        assert_eq!(taints[1].key, "example.com/impending-termination");
    }

    #[test]
    fn add_or_update_replaces_differing_value() {
        let mut stale = configured_taint().as_taint();
        stale.value = Some("stale".to_string());
        let mut node = Node::default();
        node.spec.get_or_insert_with(Default::default).taints = Some(vec![stale]);

        let (node, updated) = add_or_update_taint(node, &configured_taint().as_taint());
        assert!(updated);
        let taints = node.spec.unwrap().taints.unwrap();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].value.as_deref(), Some("pending"));
    }

    #[test]
    fn add_or_update_is_a_noop_on_deep_equal_taint() {
        let mut node = Node::default();
        node.spec.get_or_insert_with(Default::default).taints =
            Some(vec![configured_taint().as_taint()]);

        let (_, updated) = add_or_update_taint(node, &configured_taint().as_taint());
        assert!(!updated);
    }

    #[test]
    fn remove_matches_on_key_and_effect_only() {
        let mut foreign_value = configured_taint().as_taint();
        foreign_value.value = Some("someone-elses".to_string());
        let mut node = Node::default();
        node.spec.get_or_insert_with(Default::default).taints = Some(vec![foreign_value]);

        let (node, updated) = remove_taint(node, &configured_taint().as_taint());
        assert!(updated);
        assert!(node.spec.unwrap().taints.unwrap().is_empty());

        let (_, updated) = remove_taint(Node::default(), &configured_taint().as_taint());
        assert!(!updated);
    }

    #[tokio::test]
    async fn apply_taints_the_node_once() {
        let cluster = FakeCluster::new(NODE);
        let handler = taint_handler(cluster.clone());

        handler.apply().await.unwrap();
        handler.apply().await.unwrap();

        let taints = node_taints(&cluster);
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "example.com/impending-termination");
        assert_eq!(taints[0].value.as_deref(), Some("pending"));
        assert_eq!(taints[0].effect, "NoSchedule");
        // The second apply found the taint in place: no write, no second event.
        assert_eq!(cluster.node_writes(), 1);
        let events = cluster.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, CORDON_EVENT_REASON);
        assert_eq!(events[0].target, NODE);
    }

    #[tokio::test]
    async fn apply_then_remove_restores_the_taint_set() {
        let cluster = FakeCluster::new(NODE);
        let mut node = cluster.node();
        let unrelated = Taint {
            key: "unrelated".to_string(),
            value: Some("keep".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        };
        node.spec.get_or_insert_with(Default::default).taints = Some(vec![unrelated.clone()]);
        cluster.set_node(node);
        let handler = taint_handler(cluster.clone());

        handler.apply().await.unwrap();
        assert_eq!(node_taints(&cluster).len(), 2);

        handler.remove().await.unwrap();
        assert_eq!(node_taints(&cluster), vec![unrelated]);
        let reasons: Vec<String> = cluster
            .events()
            .into_iter()
            .map(|event| event.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                CORDON_EVENT_REASON.to_string(),
                UNCORDON_EVENT_REASON.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn remove_without_cordon_is_a_noop() {
        let cluster = FakeCluster::new(NODE);
        let handler = taint_handler(cluster.clone());

        handler.remove().await.unwrap();

        assert_eq!(cluster.node_writes(), 0);
        assert!(cluster.events().is_empty());
    }

    #[tokio::test]
    async fn annotation_backend_tracks_the_cordon() {
        let cluster = FakeCluster::new(NODE);
        let handler = NodeCordonHandler::new(
            cluster.clone(),
            NODE.to_string(),
            CordonBackend::Annotation("example.com/impending-termination".to_string()),
        );

        handler.apply().await.unwrap();
        handler.apply().await.unwrap();
        let annotations = cluster.node().metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("example.com/impending-termination").map(String::as_str),
            Some("true")
        );
        assert_eq!(cluster.node_writes(), 1);

        handler.remove().await.unwrap();
        let annotations = cluster.node().metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("example.com/impending-termination").map(String::as_str),
            Some("false")
        );
    }

    #[tokio::test]
    async fn update_conflict_surfaces_to_the_caller() {
        let cluster = FakeCluster::new(NODE);
        cluster.fail_updates_with_conflict(1);
        let handler = taint_handler(cluster.clone());

        // The retry policy belongs to the handler loop, not to the controller.
        assert!(handler.apply().await.is_err());
        assert!(cluster.events().is_empty());

        handler.apply().await.unwrap();
        assert_eq!(cluster.node_writes(), 1);
    }
}
