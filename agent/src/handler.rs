//! Drives the graceful shutdown sequence in response to termination state
//! changes.
//!
//! Every snapshot maps to one of two plans: no pending termination clears the
//! cordon; a pending termination cordons the node, evicts its pods within the
//! remaining window, and reboots the host when a reboot is worthwhile. Plans
//! run under a bounded exponential backoff, making this loop the sole retry
//! boundary for transient cluster errors.

use crate::notify::TerminationNotifier;
use crate::source::TerminationSource;

use chrono::Utc;
use models::node::cordon::CordonHandler;
use models::node::eviction::PodEvictor;
use models::node::{ExcludeSet, NodeTerminationState};
use snafu::ResultExt;
use std::io;
use tokio::time::Duration;
use tokio_retry::Retry;
use tracing::{event, Level};

use self::error::Result;

// Backoff applied to a failing action plan before giving up.
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_FACTOR: f64 = 1.2;
const RETRY_MAX_ATTEMPTS: usize = 10;

// Nodes with at least this much lead time hold a slice of it back for the
// host reboot and provider finalization. Shorter windows belong to
// preemptible nodes, which are deleted rather than rebooted.
const REBOOT_RESERVATION_THRESHOLD: Duration = Duration::from_secs(120);
const REBOOT_RESERVATION: Duration = Duration::from_secs(60);

fn retry_strategy() -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(RETRY_INITIAL_DELAY), |delay| {
        Some(delay.mul_f64(RETRY_BACKOFF_FACTOR))
    })
    .take(RETRY_MAX_ATTEMPTS - 1)
}

/// Host reboot entry point. The real implementation does not return on
/// success.
pub trait Rebooter {
    fn sync(&self);
    fn reboot(&self) -> io::Result<()>;
}

/// Issues reboot(2), syncing filesystems first.
pub struct SystemRebooter;

impl Rebooter for SystemRebooter {
    fn sync(&self) {
        nix::unistd::sync();
    }

    fn reboot(&self) -> io::Result<()> {
        match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

pub struct NodeTerminationHandler<S, C, P, R> {
    source: S,
    cordon: C,
    evictor: P,
    rebooter: R,
    exclude_pods: ExcludeSet,
    notifier: Option<TerminationNotifier>,
}

impl<S, C, P, R> NodeTerminationHandler<S, C, P, R>
where
    S: TerminationSource,
    C: CordonHandler,
    P: PodEvictor,
    R: Rebooter,
{
    pub fn new(
        source: S,
        cordon: C,
        evictor: P,
        rebooter: R,
        exclude_pods: ExcludeSet,
        notifier: Option<TerminationNotifier>,
    ) -> Self {
        Self {
            source,
            cordon,
            evictor,
            rebooter,
            exclude_pods,
            notifier,
        }
    }

    /// Runs until the state stream closes or a plan exhausts its retries.
    pub async fn start(mut self) -> Result<()> {
        let mut current = self.source.current_state().await;
        event!(Level::DEBUG, state = ?current, "processing initial node state");
        self.notify(&current).await;
        self.handle_state(&current).await?;

        let mut updates = self.source.watch_state();
        while let Some(state) = updates.recv().await {
            // Watches may republish; only a structural change warrants another
            // pass.
            if state == current {
                continue;
            }
            current = state;
            self.notify(&current).await;
            Retry::spawn(retry_strategy(), || async {
                let result = self.handle_state(&current).await;
                if let Err(ref err) = result {
                    event!(
                        Level::ERROR,
                        error = %err,
                        state = ?current,
                        "failed to act on node state; retrying"
                    );
                }
                result
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_state(&self, state: &NodeTerminationState) -> Result<()> {
        if !state.pending_termination {
            event!(Level::DEBUG, "no pending termination; clearing the cordon");
            return self.cordon.remove().await.context(error::CordonSnafu);
        }

        let mut timeout = (state.termination_time - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if timeout >= REBOOT_RESERVATION_THRESHOLD {
            timeout -= REBOOT_RESERVATION;
        }
        event!(
            Level::INFO,
            timeout_secs = timeout.as_secs(),
            needs_reboot = state.needs_reboot,
            "handling impending termination"
        );
        self.cordon.apply().await.context(error::CordonSnafu)?;
        self.evictor
            .evict_pods(&self.exclude_pods, timeout)
            .await
            .context(error::EvictionSnafu)?;
        if state.needs_reboot {
            event!(Level::INFO, "rebooting the node");
            self.rebooter.sync();
            match self.rebooter.reboot() {
                Err(source) => Err(error::Error::Reboot { source }),
                // reboot(2) only returns on failure; getting here means the
                // host did not actually go down.
                Ok(()) => error::RebootReturnedSnafu.fail(),
            }
        } else {
            Ok(())
        }
    }

    async fn notify(&self, state: &NodeTerminationState) {
        if !state.pending_termination {
            return;
        }
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify(state).await {
                event!(Level::WARN, error = %err, "termination notification failed");
            }
        }
    }
}

pub mod error {
    use models::node::{cordon, eviction};
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to update the node cordon: '{}'", source))]
        Cordon { source: cordon::error::Error },

        #[snafu(display("Unable to evict pods from the node: '{}'", source))]
        Eviction { source: eviction::error::Error },

        #[snafu(display("Reboot syscall failed: '{}'", source))]
        Reboot { source: std::io::Error },

        #[snafu(display("Reboot syscall returned without taking the host down"))]
        RebootReturned,
    }
}

#[cfg(any(test, feature = "mockall"))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock rebooter for use in tests.
        pub Rebooter {}

        impl Rebooter for Rebooter {
            fn sync(&self);
            fn reboot(&self) -> io::Result<()>;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRebooter;
    use super::*;
    use crate::source::mock::MockTerminationSource;
    use models::node::cordon;
    use models::node::cordon::mock::MockCordonHandler;
    use models::node::eviction::mock::MockPodEvictor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Source whose stream delivers the given snapshots and then closes.
    fn mock_source(
        state: NodeTerminationState,
        snapshots: Vec<NodeTerminationState>,
    ) -> MockTerminationSource {
        let (tx, rx) = mpsc::channel(snapshots.len().max(1));
        for snapshot in snapshots {
            tx.try_send(snapshot).unwrap();
        }
        drop(tx);
        let mut source = MockTerminationSource::new();
        source
            .expect_current_state()
            .returning(move || state.clone());
        source.expect_watch_state().return_once(move || rx);
        source
    }

    /// Rebooter that must not be touched.
    fn quiet_rebooter() -> MockRebooter {
        let mut rebooter = MockRebooter::new();
        rebooter.expect_sync().never();
        rebooter.expect_reboot().never();
        rebooter
    }

    fn steady_state() -> NodeTerminationState {
        NodeTerminationState {
            node_name: "localhost".to_string(),
            pending_termination: false,
            termination_time: Utc::now(),
            needs_reboot: false,
        }
    }

    fn pending_state(needs_reboot: bool, window_secs: i64) -> NodeTerminationState {
        NodeTerminationState {
            node_name: "localhost".to_string(),
            pending_termination: true,
            termination_time: Utc::now() + chrono::Duration::seconds(window_secs),
            needs_reboot,
        }
    }

    fn handler(
        source: MockTerminationSource,
        cordon: MockCordonHandler,
        evictor: MockPodEvictor,
        rebooter: MockRebooter,
    ) -> NodeTerminationHandler<MockTerminationSource, MockCordonHandler, MockPodEvictor, MockRebooter>
    {
        NodeTerminationHandler::new(
            source,
            cordon,
            evictor,
            rebooter,
            ExcludeSet::default(),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn steady_state_clears_the_cordon_and_exits_on_closed_stream() {
        let mut cordon = MockCordonHandler::new();
        cordon.expect_remove().times(1).returning(|| Ok(()));
        let mut evictor = MockPodEvictor::new();
        evictor.expect_evict_pods().never();

        handler(
            mock_source(steady_state(), vec![]),
            cordon,
            evictor,
            quiet_rebooter(),
        )
        .start()
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn preemption_evicts_with_the_full_window_and_skips_reboot() {
        let mut cordon = MockCordonHandler::new();
        cordon.expect_remove().times(1).returning(|| Ok(()));
        cordon.expect_apply().times(1).returning(|| Ok(()));
        let mut evictor = MockPodEvictor::new();
        evictor
            .expect_evict_pods()
            .times(1)
            // The thirty second window is below the reboot reservation
            // threshold, so nothing is subtracted from it.
            .withf(|_, timeout| {
                *timeout > Duration::from_secs(28) && *timeout <= Duration::from_secs(30)
            })
            .returning(|_, _| Ok(()));

        handler(
            mock_source(steady_state(), vec![pending_state(false, 30)]),
            cordon,
            evictor,
            quiet_rebooter(),
        )
        .start()
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_reserves_a_reboot_slice_and_reboots() {
        let mut cordon = MockCordonHandler::new();
        cordon.expect_remove().times(1).returning(|| Ok(()));
        // The reboot syscall keeps failing, so the whole plan is retried until
        // the backoff budget is exhausted.
        cordon
            .expect_apply()
            .times(RETRY_MAX_ATTEMPTS)
            .returning(|| Ok(()));
        let mut evictor = MockPodEvictor::new();
        evictor
            .expect_evict_pods()
            .times(RETRY_MAX_ATTEMPTS)
            // One hour minus the sixty second reboot reservation.
            .withf(|_, timeout| {
                *timeout > Duration::from_secs(3538) && *timeout <= Duration::from_secs(3540)
            })
            .returning(|_, _| Ok(()));
        let mut rebooter = MockRebooter::new();
        rebooter
            .expect_sync()
            .times(RETRY_MAX_ATTEMPTS)
            .return_const(());
        rebooter
            .expect_reboot()
            .times(RETRY_MAX_ATTEMPTS)
            .returning(|| {
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "reboot rejected in tests",
                ))
            });

        let result = handler(
            mock_source(steady_state(), vec![pending_state(true, 3600)]),
            cordon,
            evictor,
            rebooter,
        )
        .start()
        .await;

        assert!(matches!(result, Err(error::Error::Reboot { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_cordon_error_is_retried() {
        let mut cordon = MockCordonHandler::new();
        cordon.expect_remove().times(1).returning(|| Ok(()));
        let failures = Arc::new(AtomicUsize::new(1));
        cordon.expect_apply().times(2).returning(move || {
            if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            }) == Ok(1)
            {
                Err(cordon::error::Error::UpdateNode {
                    source: kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "the object has been modified".to_string(),
                        reason: "Conflict".to_string(),
                        code: 409,
                    }),
                    node_name: "localhost".to_string(),
                })
            } else {
                Ok(())
            }
        });
        let mut evictor = MockPodEvictor::new();
        evictor
            .expect_evict_pods()
            .times(1)
            .returning(|_, _| Ok(()));

        handler(
            mock_source(steady_state(), vec![pending_state(false, 30)]),
            cordon,
            evictor,
            quiet_rebooter(),
        )
        .start()
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn republished_snapshot_produces_no_action() {
        let initial = steady_state();
        let mut cordon = MockCordonHandler::new();
        // Only the initial pass acts; the identical republished snapshot is
        // skipped.
        cordon.expect_remove().times(1).returning(|| Ok(()));
        let mut evictor = MockPodEvictor::new();
        evictor.expect_evict_pods().never();

        handler(
            mock_source(initial.clone(), vec![initial.clone(), initial]),
            cordon,
            evictor,
            quiet_rebooter(),
        )
        .start()
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_still_runs_the_plan_with_a_zero_budget() {
        let mut cordon = MockCordonHandler::new();
        cordon.expect_remove().times(1).returning(|| Ok(()));
        cordon.expect_apply().times(1).returning(|| Ok(()));
        let mut evictor = MockPodEvictor::new();
        evictor
            .expect_evict_pods()
            .times(1)
            .withf(|_, timeout| *timeout == Duration::ZERO)
            .returning(|_, _| Ok(()));

        handler(
            mock_source(steady_state(), vec![pending_state(false, -5)]),
            cordon,
            evictor,
            quiet_rebooter(),
        )
        .start()
        .await
        .unwrap();
    }
}
