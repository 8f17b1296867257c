//! Tracks impending VM terminations announced through the GCE metadata server
//! and republishes them as node termination state snapshots.
//!
//! Two metadata keys are watched concurrently: `maintenance-event` for
//! regular (non-migratable) VMs and `preempted` for preemptible VMs. Both
//! feed the same interpretation rule, which dispatches on the instance class
//! probed at startup.

use crate::metadata::MetadataClient;

use async_trait::async_trait;
use chrono::Utc;
use models::node::NodeTerminationState;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

use self::error::Result;

const ON_HOST_MAINTENANCE_KEY: &str = "instance/scheduling/on-host-maintenance";
const PREEMPTIBLE_KEY: &str = "instance/scheduling/preemptible";
const INSTANCE_NAME_KEY: &str = "instance/name";
const MAINTENANCE_EVENT_KEY: &str = "instance/maintenance-event";
const PREEMPTED_KEY: &str = "instance/preempted";

// Scheduling policy of instances that cannot be live-migrated around host
// maintenance; anything else never terminates for it.
const MAINTENANCE_POLICY_TERMINATE: &str = "TERMINATE";
// Value observed on `maintenance-event` when a regular VM is about to be
// disrupted.
const MAINTENANCE_EVENT_TERMINATE: &str = "TERMINATE_ON_HOST_MAINTENANCE";
// Value observed on `preemptible` and `preempted`.
const METADATA_TRUE: &str = "TRUE";

// Preemptible VMs get roughly thirty seconds between the preemption notice
// and power-off.
const PREEMPTIBLE_TERMINATION_WINDOW_SECS: i64 = 30;

// Pause before reconnecting a failed metadata watch.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

// Snapshots are handed over one at a time; a stalled consumer intentionally
// backpressures the metadata workers rather than dropping a transition.
const STATE_CHANNEL_CAPACITY: usize = 1;

#[async_trait]
pub trait TerminationSource {
    /// A copy of the latest termination state.
    async fn current_state(&self) -> NodeTerminationState;

    /// Stream of state snapshots, one per observed change. The stream is
    /// closed from the start when the instance is not subject to disruptive
    /// maintenance.
    fn watch_state(&mut self) -> mpsc::Receiver<NodeTerminationState>;
}

pub struct GceTerminationSource {
    metadata: MetadataClient,
    needs_termination_handling: bool,
    signals: Arc<SignalState>,
}

/// State shared with the metadata subscription workers.
struct SignalState {
    state: RwLock<NodeTerminationState>,
    regular_termination_window: chrono::Duration,
}

impl SignalState {
    /// A value confirms an impending termination when it matches what this
    /// instance class is expected to observe: regular VMs see
    /// `TERMINATE_ON_HOST_MAINTENANCE` on `maintenance-event`, preemptible
    /// VMs see `TRUE` on `preempted`. Anything else clears the record.
    fn confirms_termination(needs_reboot: bool, value: &str) -> bool {
        (needs_reboot && value == MAINTENANCE_EVENT_TERMINATE)
            || (!needs_reboot && value == METADATA_TRUE)
    }

    fn record_pending_termination(&self, state: &mut NodeTerminationState) {
        state.pending_termination = true;
        let window = if state.needs_reboot {
            self.regular_termination_window
        } else {
            chrono::Duration::seconds(PREEMPTIBLE_TERMINATION_WINDOW_SECS)
        };
        state.termination_time = Utc::now() + window;
    }

    fn clear_pending_termination(&self, state: &mut NodeTerminationState) {
        state.pending_termination = false;
        state.termination_time = Utc::now();
    }

    /// Applies an observed metadata value and returns the snapshot to publish.
    async fn apply_signal(&self, value: &str) -> NodeTerminationState {
        let mut state = self.state.write().await;
        if Self::confirms_termination(state.needs_reboot, value) {
            event!(Level::INFO, value, "recording impending termination");
            self.record_pending_termination(&mut state);
        } else {
            event!(Level::INFO, value, "clearing any impending termination record");
            self.clear_pending_termination(&mut state);
        }
        state.clone()
    }
}

impl GceTerminationSource {
    /// Probes the metadata server for the fixed instance facts and for a
    /// termination that may already be under way (the process could have
    /// restarted mid-handling). Missing keys here mean the environment is
    /// misconfigured, which is fatal.
    #[instrument(skip(metadata), err)]
    pub async fn new(metadata: MetadataClient, regular_vm_timeout: Duration) -> Result<Self> {
        let regular_termination_window = chrono::Duration::from_std(regular_vm_timeout)
            .context(error::TimeoutOutOfRangeSnafu)?;

        let maintenance_policy = Self::probe(&metadata, ON_HOST_MAINTENANCE_KEY).await?;
        let needs_termination_handling = maintenance_policy == MAINTENANCE_POLICY_TERMINATE;
        let node_name = Self::probe(&metadata, INSTANCE_NAME_KEY).await?;
        let needs_reboot = Self::probe(&metadata, PREEMPTIBLE_KEY).await? != METADATA_TRUE;

        let signals = Arc::new(SignalState {
            state: RwLock::new(NodeTerminationState {
                node_name,
                pending_termination: false,
                termination_time: Utc::now(),
                needs_reboot,
            }),
            regular_termination_window,
        });

        let maintenance_event = Self::probe(&metadata, MAINTENANCE_EVENT_KEY).await?;
        let preempted = Self::probe(&metadata, PREEMPTED_KEY).await?;
        if SignalState::confirms_termination(needs_reboot, &maintenance_event)
            || SignalState::confirms_termination(needs_reboot, &preempted)
        {
            let mut state = signals.state.write().await;
            event!(Level::WARN, "termination already pending at startup");
            signals.record_pending_termination(&mut state);
        }

        Ok(Self {
            metadata,
            needs_termination_handling,
            signals,
        })
    }

    pub fn needs_termination_handling(&self) -> bool {
        self.needs_termination_handling
    }

    async fn probe(metadata: &MetadataClient, key: &str) -> Result<String> {
        metadata.get(key).await.context(error::ProbeSnafu { key })
    }
}

#[async_trait]
impl TerminationSource for GceTerminationSource {
    async fn current_state(&self) -> NodeTerminationState {
        self.signals.state.read().await.clone()
    }

    fn watch_state(&mut self) -> mpsc::Receiver<NodeTerminationState> {
        let (tx, rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        if !self.needs_termination_handling {
            event!(
                Level::INFO,
                "instance is not subject to disruptive maintenance; nothing to watch"
            );
            return rx;
        }
        for key in [MAINTENANCE_EVENT_KEY, PREEMPTED_KEY] {
            let worker = SignalWorker {
                metadata: self.metadata.clone(),
                signals: Arc::clone(&self.signals),
                updates: tx.clone(),
            };
            tokio::spawn(async move { worker.run(key).await });
        }
        rx
    }
}

/// One long-poll subscription on a single metadata key.
struct SignalWorker {
    metadata: MetadataClient,
    signals: Arc<SignalState>,
    updates: mpsc::Sender<NodeTerminationState>,
}

impl SignalWorker {
    async fn run(&self, key: &'static str) {
        loop {
            let result = self.metadata.watch(key, |value| self.observe(value)).await;
            if let Err(err) = result {
                event!(
                    Level::ERROR,
                    error = %err,
                    key,
                    "metadata watch failed; reconnecting"
                );
            }
            sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    async fn observe(&self, value: String) {
        let snapshot = self.signals.apply_signal(&value).await;
        if self.updates.send(snapshot).await.is_err() {
            // The consumer is gone; the process is on its way out.
            event!(Level::DEBUG, "state snapshot dropped: consumer closed");
        }
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read '{}' from instance metadata: '{}'", key, source))]
        Probe {
            source: crate::metadata::error::Error,
            key: String,
        },

        #[snafu(display("Regular VM termination timeout is out of range: '{}'", source))]
        TimeoutOutOfRange { source: chrono::OutOfRangeError },
    }
}

#[cfg(any(test, feature = "mockall"))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock termination source for use in tests.
        pub TerminationSource {}

        #[async_trait]
        impl TerminationSource for TerminationSource {
            async fn current_state(&self) -> NodeTerminationState;
            fn watch_state(&mut self) -> mpsc::Receiver<NodeTerminationState>;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal_state(needs_reboot: bool, regular_window_secs: i64) -> SignalState {
        SignalState {
            state: RwLock::new(NodeTerminationState {
                node_name: "localhost".to_string(),
                pending_termination: false,
                termination_time: Utc::now(),
                needs_reboot,
            }),
            regular_termination_window: chrono::Duration::seconds(regular_window_secs),
        }
    }

    #[test]
    fn signal_interpretation_dispatches_on_instance_class() {
        // Regular VM: only the maintenance-event value counts.
        assert!(SignalState::confirms_termination(true, "TERMINATE_ON_HOST_MAINTENANCE"));
        assert!(!SignalState::confirms_termination(true, "TRUE"));
        assert!(!SignalState::confirms_termination(true, ""));
        assert!(!SignalState::confirms_termination(true, "NONE"));
        // Preemptible VM: only the preempted value counts.
        assert!(SignalState::confirms_termination(false, "TRUE"));
        assert!(!SignalState::confirms_termination(false, "TERMINATE_ON_HOST_MAINTENANCE"));
        assert!(!SignalState::confirms_termination(false, "FALSE"));
    }

    #[tokio::test]
    async fn preemption_sets_a_thirty_second_deadline() {
        let signals = signal_state(false, 3600);

        let before = Utc::now();
        let snapshot = signals.apply_signal("TRUE").await;

        assert!(snapshot.pending_termination);
        assert!(!snapshot.needs_reboot);
        let window = snapshot.termination_time - before;
        assert!(window >= chrono::Duration::seconds(30));
        assert!(window <= chrono::Duration::seconds(31));

        // Any other value clears the record and pulls the deadline back.
        let snapshot = signals.apply_signal("FALSE").await;
        assert!(!snapshot.pending_termination);
        assert!(snapshot.termination_time <= Utc::now());
    }

    #[tokio::test]
    async fn maintenance_event_uses_the_configured_window() {
        let signals = signal_state(true, 3600);

        let before = Utc::now();
        let snapshot = signals.apply_signal("TERMINATE_ON_HOST_MAINTENANCE").await;

        assert!(snapshot.pending_termination);
        assert!(snapshot.needs_reboot);
        let window = snapshot.termination_time - before;
        assert!(window >= chrono::Duration::seconds(3600));
        assert!(window <= chrono::Duration::seconds(3601));
    }

    #[tokio::test]
    async fn preemption_value_does_not_trip_a_regular_vm() {
        let signals = signal_state(true, 3600);

        let snapshot = signals.apply_signal("TRUE").await;

        assert!(!snapshot.pending_termination);
    }

    #[tokio::test]
    async fn worker_publishes_snapshots_in_order() {
        let (tx, mut rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);
        let worker = SignalWorker {
            metadata: MetadataClient::new().unwrap(),
            signals: Arc::new(signal_state(false, 3600)),
            updates: tx,
        };

        worker.observe("TRUE".to_string()).await;
        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.pending_termination);

        worker.observe("FALSE".to_string()).await;
        let snapshot = rx.recv().await.unwrap();
        assert!(!snapshot.pending_termination);
    }
}
