use crate::{handler, metadata, source};

use models::node::cordon;
use models::telemetry::TelemetryConfigError;
use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create kubernetes client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Unable to derive in-cluster kubernetes configuration: '{}'", source))]
    InClusterConfig {
        source: kube::config::InClusterError,
    },

    #[snafu(display("Unable to load kubeconfig: '{}'", source))]
    KubeconfigLoad {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("--taint must not be specified together with --annotation"))]
    CordonMarkingConflict,

    #[snafu(display("One of --taint or --annotation must be specified"))]
    CordonMarkingMissing,

    #[snafu(display("Invalid --taint flag: {}", source))]
    InvalidTaint { source: cordon::error::Error },

    #[snafu(display("Unable to build metadata client: '{}'", source))]
    MetadataClient { source: metadata::error::Error },

    #[snafu(display("Unable to initialize the termination source: '{}'", source))]
    TerminationSource { source: source::error::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TracingConfiguration { source: TelemetryConfigError },

    #[snafu(display("Termination handling failed: '{}'", source))]
    Handler { source: handler::error::Error },

    #[snafu(display("Node state stream ended while termination handling was still required"))]
    StateStreamEnded,
}
