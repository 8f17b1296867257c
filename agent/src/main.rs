use agent::error::{self, Result};
use agent::handler::{NodeTerminationHandler, SystemRebooter};
use agent::metadata::MetadataClient;
use agent::notify::TerminationNotifier;
use agent::source::{GceTerminationSource, TerminationSource};

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use models::cluster::K8sClusterApi;
use models::node::cordon::{CordonBackend, NodeCordonHandler, TaintConfig};
use models::node::eviction::PodEvictionHandler;
use models::node::ExcludeSet;
use models::telemetry::init_telemetry_from_env;
use snafu::ResultExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, process};
use tracing::{event, Level};

const TERMINATION_LOG: &str = "/dev/termination-log";

#[derive(Debug, Parser)]
#[command(
    name = "node-termination-handler",
    about = "Gracefully drains the local node when the cloud provider announces that its VM is about to be reclaimed."
)]
struct Args {
    /// Set to false when running outside of a kubernetes cluster.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    in_cluster: bool,

    /// Path to a kubeconfig file; defaults to $HOME/.kube/config. Only used
    /// with --in-cluster=false.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Termination timeout for regular VMs. The default matches the grace
    /// window of GPU VMs.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    regular_vm_timeout: Duration,

    /// Pods to exclude from eviction, as comma separated 'name:namespace'
    /// pairs.
    #[arg(long, default_value = "", value_parser = ExcludeSet::from_str)]
    exclude_pods: ExcludeSet,

    /// Taint to place on the node while handling terminations, as
    /// 'key:value:effect'.
    #[arg(long)]
    taint: Option<String>,

    /// Annotation key to set on the node while handling terminations.
    #[arg(long)]
    annotation: Option<String>,

    /// Time reserved for system pods to exit gracefully.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    system_pod_grace_period: Duration,
}

#[tokio::main]
async fn main() {
    let termination_log =
        env::var("TERMINATION_LOG").unwrap_or_else(|_| TERMINATION_LOG.to_string());

    if let Err(error) = run().await {
        eprintln!("{}", error);
        // Surface the failure to `kubectl describe` as well.
        let _ = fs::write(&termination_log, format!("{}", error));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_telemetry_from_env().context(error::TracingConfigurationSnafu)?;
    let args = Args::parse();

    let backend = cordon_backend(args.taint.as_deref(), args.annotation.as_deref())?;
    let client = kube_client(&args).await?;

    let metadata = MetadataClient::new().context(error::MetadataClientSnafu)?;
    let source = GceTerminationSource::new(metadata.clone(), args.regular_vm_timeout)
        .await
        .context(error::TerminationSourceSnafu)?;
    let needs_termination_handling = source.needs_termination_handling();
    let state = source.current_state().await;
    event!(
        Level::INFO,
        node_name = %state.node_name,
        needs_reboot = state.needs_reboot,
        excluded_pods = args.exclude_pods.len(),
        "starting node termination handler"
    );

    let cluster = K8sClusterApi::new(client, &state.node_name);
    let cordon = NodeCordonHandler::new(cluster.clone(), state.node_name.clone(), backend);
    let evictor = PodEvictionHandler::new(
        cluster,
        state.node_name.clone(),
        args.system_pod_grace_period,
    );
    let notifier = TerminationNotifier::from_env(metadata);

    NodeTerminationHandler::new(
        source,
        cordon,
        evictor,
        SystemRebooter,
        args.exclude_pods,
        notifier,
    )
    .start()
    .await
    .context(error::HandlerSnafu)?;

    // start() only returns cleanly when the snapshot stream closes; that is
    // expected solely for instances that never needed termination handling.
    if needs_termination_handling {
        return error::StateStreamEndedSnafu.fail();
    }
    event!(
        Level::INFO,
        "instance is not subject to termination events; exiting"
    );
    Ok(())
}

/// Resolves the cordon backend from the flag pair. Exactly one of the two
/// flags must carry a value; empty strings count as unset, matching the
/// empty-string defaults found in container manifests.
fn cordon_backend(taint: Option<&str>, annotation: Option<&str>) -> Result<CordonBackend> {
    let taint = taint.filter(|value| !value.is_empty());
    let annotation = annotation.filter(|value| !value.is_empty());
    match (taint, annotation) {
        (Some(_), Some(_)) => error::CordonMarkingConflictSnafu.fail(),
        (None, None) => error::CordonMarkingMissingSnafu.fail(),
        (Some(taint), None) => Ok(CordonBackend::Taint(
            taint
                .parse::<TaintConfig>()
                .context(error::InvalidTaintSnafu)?,
        )),
        (None, Some(key)) => Ok(CordonBackend::Annotation(key.to_string())),
    }
}

async fn kube_client(args: &Args) -> Result<Client> {
    let config = if args.in_cluster {
        Config::incluster().context(error::InClusterConfigSnafu)?
    } else {
        let path = args
            .kubeconfig
            .clone()
            .unwrap_or_else(default_kubeconfig_path);
        let kubeconfig = Kubeconfig::read_from(&path).context(error::KubeconfigLoadSnafu)?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context(error::KubeconfigLoadSnafu)?
    };
    Client::try_from(config).context(error::ClientCreateSnafu)
}

fn default_kubeconfig_path() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".kube")
        .join("config")
}
