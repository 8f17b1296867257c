//! Optional chat-webhook announcement of impending terminations.

use crate::metadata::MetadataClient;

use models::node::NodeTerminationState;
use serde_json::json;
use snafu::ResultExt;
use std::env;
use tracing::instrument;

use self::error::Result;

const WEBHOOK_URL_ENV_VAR: &str = "SLACK_WEBHOOK_URL";

const MACHINE_TYPE_KEY: &str = "instance/machine-type";
const ZONE_KEY: &str = "instance/zone";
const PROJECT_ID_KEY: &str = "project/project-id";

pub struct TerminationNotifier {
    http: reqwest::Client,
    metadata: MetadataClient,
    webhook_url: String,
}

impl TerminationNotifier {
    /// Builds a notifier when a webhook is configured in the environment;
    /// otherwise notification stays disabled.
    pub fn from_env(metadata: MetadataClient) -> Option<Self> {
        let webhook_url = env::var(WEBHOOK_URL_ENV_VAR)
            .ok()
            .filter(|url| !url.is_empty())?;
        Some(Self {
            http: reqwest::Client::new(),
            metadata,
            webhook_url,
        })
    }

    /// Announces the impending termination. Failures are the caller's to log;
    /// they never gate the shutdown sequence.
    #[instrument(skip(self, state), err)]
    pub async fn notify(&self, state: &NodeTerminationState) -> Result<()> {
        let machine_type = self
            .metadata
            .get(MACHINE_TYPE_KEY)
            .await
            .context(error::MetadataSnafu)?;
        let zone = self.metadata.get(ZONE_KEY).await.context(error::MetadataSnafu)?;
        let project_id = self
            .metadata
            .get(PROJECT_ID_KEY)
            .await
            .context(error::MetadataSnafu)?;

        let payload = json!({
            "attachments": [{
                "color": "warning",
                "title": ":warning: Node Termination",
                "fields": [
                    { "title": "InstanceName", "value": state.node_name, "short": false },
                    { "title": "MachineType", "value": machine_type, "short": false },
                    { "title": "Zone", "value": zone, "short": true },
                    { "title": "ProjectID", "value": project_id, "short": true },
                ],
            }],
        });
        self.http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context(error::SendSnafu)?
            .error_for_status()
            .context(error::SendSnafu)?;
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to gather instance details for notification: '{}'", source))]
        Metadata {
            source: crate::metadata::error::Error,
        },

        #[snafu(display("Unable to deliver webhook notification: '{}'", source))]
        Send { source: reqwest::Error },
    }
}
