// The component name under which cluster events are recorded.
pub const EVENT_SOURCE: &str = "NodeTerminationHandler";

// The namespace reserved for cluster infrastructure pods such as log shippers
// and metric collectors. Pods there are evicted after everything else so they
// can flush whatever the rest of the node produced while shutting down.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

// Event reasons recorded on the node and on evicted pods.
pub const CORDON_EVENT_REASON: &str = "ImpendingNodeTermination";
pub const UNCORDON_EVENT_REASON: &str = "NoImpendingNodeTermination";
pub const EVICTION_EVENT_REASON: &str = "NodeTermination";
