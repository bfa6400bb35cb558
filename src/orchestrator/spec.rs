//! Launch specifications for integration processes.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::catalog::{IntegrationCatalog, IntegrationParams};
use crate::config::OrchestratorConfig;
use crate::integration::{IntegrationType, TransportMode};
use crate::orchestrator::error::{OrchestratorError, Result};

/// Label marking containers owned by this orchestrator.
pub const MANAGED_LABEL: &str = "toolfleet.managed";
pub const CUSTOMER_LABEL: &str = "toolfleet.customer";
pub const INTEGRATION_LABEL: &str = "toolfleet.integration";

const DEFAULT_TELEPHONY_REGION: &str = "mypurecloud.com";

/// Everything a runtime needs to start one integration process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub customer: String,
    pub integration: IntegrationType,
    /// Unique process/container name.
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub secret_env: Vec<(String, SecretString)>,
    /// Host port the process is reachable on.
    pub port: u16,
    /// Port inside the container.
    pub internal_port: u16,
    pub network: String,
    pub labels: Vec<(String, String)>,
    pub transport: TransportMode,
    pub endpoint_url: String,
    pub health_url: String,
}

impl ProcessSpec {
    /// `KEY=value` pairs with secrets exposed, for handing to the runtime.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(
                self.secret_env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.expose_secret())),
            )
            .collect()
    }
}

/// Builds [`ProcessSpec`]s from the catalog. Pure: no allocation, no I/O.
#[derive(Clone)]
pub struct ProcessSpecBuilder {
    catalog: Arc<IntegrationCatalog>,
    config: Arc<OrchestratorConfig>,
}

impl ProcessSpecBuilder {
    pub fn new(catalog: Arc<IntegrationCatalog>, config: Arc<OrchestratorConfig>) -> Self {
        Self { catalog, config }
    }

    /// Catalog parameters for a key, or the configuration error for it.
    pub fn params(&self, customer: &str, ty: IntegrationType) -> Result<&IntegrationParams> {
        if self.catalog.customer(customer).is_none() {
            return Err(OrchestratorError::UnknownCustomer {
                name: customer.to_string(),
            });
        }
        self.catalog
            .integration(customer, ty)
            .ok_or_else(|| OrchestratorError::UnknownIntegration {
                customer: customer.to_string(),
                integration: ty,
            })
    }

    pub fn build(&self, customer: &str, ty: IntegrationType, port: u16) -> Result<ProcessSpec> {
        let params = self.params(customer, ty)?;
        let internal_port = ty.internal_port();

        let mut args = Vec::new();
        let mut env = Vec::new();
        let mut secret_env = Vec::new();

        match ty {
            IntegrationType::Metrics => {
                args.extend([
                    "--transport".to_string(),
                    "streamable-http".to_string(),
                    "--address".to_string(),
                    format!("0.0.0.0:{}", internal_port),
                ]);
                env.push((
                    "GRAFANA_URL".to_string(),
                    params.target_url.clone().unwrap_or_default(),
                ));
                if let Some(token) = params.credential("token") {
                    secret_env.push(("GRAFANA_SERVICE_ACCOUNT_TOKEN".to_string(), token.clone()));
                }
            }
            IntegrationType::Alerting => {
                env.push((
                    "ALERTMANAGER_URL".to_string(),
                    params.target_url.clone().unwrap_or_default(),
                ));
                env.push(("MCP_TRANSPORT".to_string(), "sse".to_string()));
            }
            IntegrationType::Telephony => {
                env.push((
                    "GENESYSCLOUD_REGION".to_string(),
                    params
                        .region
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TELEPHONY_REGION.to_string()),
                ));
                env.push(("MCP_TRANSPORT".to_string(), "sse".to_string()));
                if let Some(id) = params.credential("client_id") {
                    secret_env.push(("GENESYSCLOUD_OAUTHCLIENT_ID".to_string(), id.clone()));
                }
                if let Some(secret) = params.credential("client_secret") {
                    secret_env.push((
                        "GENESYSCLOUD_OAUTHCLIENT_SECRET".to_string(),
                        secret.clone(),
                    ));
                }
            }
        }

        let base = format!("http://{}:{}", self.config.endpoint_host, port);

        Ok(ProcessSpec {
            customer: customer.to_string(),
            integration: ty,
            name: container_name(customer, ty),
            image: self.config.image(ty).to_string(),
            args,
            env,
            secret_env,
            port,
            internal_port,
            network: self.config.network.clone(),
            labels: vec![
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (CUSTOMER_LABEL.to_string(), customer.to_string()),
                (INTEGRATION_LABEL.to_string(), ty.to_string()),
            ],
            transport: ty.transport(),
            endpoint_url: format!("{}{}", base, ty.endpoint_path()),
            health_url: format!("{}{}", base, ty.health_path()),
        })
    }
}

/// `toolfleet-<type>-<customer>`, restricted to characters Docker accepts.
pub fn container_name(customer: &str, ty: IntegrationType) -> String {
    let safe: String = customer
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => Some(c),
            ' ' => Some('-'),
            _ => None,
        })
        .collect();
    format!("toolfleet-{}-{}", ty, safe)
}
