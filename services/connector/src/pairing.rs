//! One-shot pairing handshake.

use std::path::PathBuf;

use connector_protocol::{Action, Capabilities, ConnectorInfo, PairRequest};
use thiserror::Error;
use tracing::info;

use crate::client::{ClientError, ControlPlaneClient};
use crate::config::{normalize_base_url, AgentInfo, ConfigError, Configuration, Paths};

/// Errors from pairing.
#[derive(Debug, Error)]
pub enum PairError {
    #[error(
        "connector config already exists at {}\n\nTo replace it, run:\n  cocalc-self-host-connector pair --replace --base-url {base_url} --token <pairing_token>",
        path.display()
    )]
    AlreadyPaired { path: PathBuf, base_url: String },

    #[error("pairing token rejected: {0}")]
    InvalidCredentials(String),

    #[error("pair request failed: {0}")]
    Network(String),

    #[error("unexpected pair response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ClientError> for PairError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Protocol {
                status: Some(status),
                ..
            } if (400..500).contains(&status) => PairError::InvalidCredentials(err.to_string()),
            ClientError::Protocol {
                status: Some(_), ..
            } => PairError::Network(err.to_string()),
            ClientError::Protocol { status: None, .. } => PairError::Protocol(err.to_string()),
            ClientError::Network(e) => PairError::Network(e.to_string()),
        }
    }
}

/// Inputs to [`pair`].
#[derive(Debug, Clone)]
pub struct PairOptions {
    pub base_url: String,
    pub pairing_token: String,
    pub name: Option<String>,
    /// Overwrite an existing configuration.
    pub replace: bool,
}

/// Pair with the control plane and save the resulting configuration.
pub async fn pair(
    paths: &Paths,
    options: &PairOptions,
    agent: &AgentInfo,
) -> Result<Configuration, PairError> {
    let base_url = normalize_base_url(&options.base_url).to_string();
    if paths.config().exists() && !options.replace {
        return Err(PairError::AlreadyPaired {
            path: paths.config().to_path_buf(),
            base_url,
        });
    }

    let name = options.name.clone().filter(|n| !n.trim().is_empty());
    let request = PairRequest {
        pairing_token: options.pairing_token.clone(),
        connector_info: connector_info(name.clone(), agent),
    };

    let client = ControlPlaneClient::new(&base_url, None)?;
    let response = client.pair(&request).await?;

    let config = Configuration {
        base_url,
        connector_id: response.connector_id,
        connector_token: response.connector_token,
        poll_interval_seconds: response.poll_interval_seconds,
        name: name.unwrap_or_default(),
    };
    config.save(paths.config())?;

    info!(
        connector_id = %config.connector_id,
        config = %paths.config().display(),
        "Paired connector"
    );
    Ok(config)
}

fn connector_info(name: Option<String>, agent: &AgentInfo) -> ConnectorInfo {
    ConnectorInfo {
        name,
        version: agent.version.clone(),
        os: agent.os.clone(),
        arch: agent.arch.clone(),
        capabilities: Capabilities { multipass: true },
        actions: Action::ALL.iter().map(|a| a.as_str().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_info_lists_actions() {
        let agent = AgentInfo {
            version: "1.2.3".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        };
        let value = serde_json::to_value(connector_info(Some("lab".to_string()), &agent)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "name": "lab",
                "version": "1.2.3",
                "os": "linux",
                "arch": "amd64",
                "capabilities": {"multipass": true},
                "actions": ["create", "start", "stop", "delete", "status", "resize"]
            })
        );
    }

    #[test]
    fn test_client_error_classification() {
        let rejected = ClientError::Protocol {
            status: Some(401),
            message: "pair failed (401): bad token".to_string(),
        };
        assert!(matches!(
            PairError::from(rejected),
            PairError::InvalidCredentials(_)
        ));

        let unavailable = ClientError::Protocol {
            status: Some(502),
            message: "pair failed (502): bad gateway".to_string(),
        };
        assert!(matches!(PairError::from(unavailable), PairError::Network(_)));

        let garbled = ClientError::Protocol {
            status: None,
            message: "pair decode: expected value".to_string(),
        };
        assert!(matches!(PairError::from(garbled), PairError::Protocol(_)));
    }
}
