//! Static customer catalog.
//!
//! Maps each customer to the integrations it needs and the parameters each
//! integration is launched with. Loaded once at startup from a JSON file and
//! never mutated afterwards; credentials are referenced by environment
//! variable name in the file and resolved into [`SecretString`]s at load.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::integration::IntegrationType;

/// Connection parameters for one integration of one customer.
#[derive(Debug, Clone, Default)]
pub struct IntegrationParams {
    /// Backend the provider talks to (Grafana / Alertmanager base URL).
    pub target_url: Option<String>,
    /// Cloud region, for providers that need one.
    pub region: Option<String>,
    credentials: BTreeMap<String, SecretString>,
}

impl IntegrationParams {
    pub fn credential(&self, name: &str) -> Option<&SecretString> {
        self.credentials.get(name)
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credential(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials
            .insert(name.into(), SecretString::from(value.into()));
        self
    }
}

/// One monitored environment.
#[derive(Debug, Clone)]
pub struct CustomerSpec {
    pub name: String,
    pub description: String,
    /// The monitored host, shown to operators.
    pub host: String,
    integrations: BTreeMap<IntegrationType, IntegrationParams>,
}

impl CustomerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            host: String::new(),
            integrations: BTreeMap::new(),
        }
    }

    pub fn with_integration(mut self, ty: IntegrationType, params: IntegrationParams) -> Self {
        self.integrations.insert(ty, params);
        self
    }

    /// Required integrations, in a stable order.
    pub fn required_integrations(&self) -> Vec<IntegrationType> {
        self.integrations.keys().copied().collect()
    }

    pub fn integration(&self, ty: IntegrationType) -> Option<&IntegrationParams> {
        self.integrations.get(&ty)
    }
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    default: Option<String>,
    customers: Vec<RawCustomer>,
}

#[derive(Debug, Deserialize)]
struct RawCustomer {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    integrations: Vec<RawIntegration>,
}

#[derive(Debug, Deserialize)]
struct RawIntegration {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    target_url: Option<String>,
    #[serde(default)]
    region: Option<String>,
    /// credential name -> environment variable holding it
    #[serde(default)]
    credentials: BTreeMap<String, String>,
}

/// Read-only customer catalog.
#[derive(Debug, Default)]
pub struct IntegrationCatalog {
    order: Vec<String>,
    customers: HashMap<String, Arc<CustomerSpec>>,
    default: Option<String>,
}

impl IntegrationCatalog {
    /// Load the catalog file, resolving credentials from the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Catalog {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let catalog = Self::from_json_with(&json, path, |var| std::env::var(var).ok())?;

        tracing::info!(
            path = %path.display(),
            customers = catalog.order.len(),
            "Loaded integration catalog"
        );
        Ok(catalog)
    }

    /// Parse a catalog document with a custom credential resolver.
    pub fn from_json_with<F>(json: &str, origin: &Path, resolve: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let invalid = |reason: String| ConfigError::Catalog {
            path: origin.to_path_buf(),
            reason,
        };

        let raw: RawCatalog = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;

        let mut catalog = Self {
            default: raw.default.filter(|d| !d.is_empty()),
            ..Default::default()
        };

        for customer in raw.customers {
            if customer.name.trim().is_empty() {
                return Err(invalid("customer with empty name".to_string()));
            }
            if catalog.customers.contains_key(&customer.name) {
                return Err(invalid(format!("duplicate customer '{}'", customer.name)));
            }

            let mut spec = CustomerSpec {
                name: customer.name.clone(),
                description: customer.description,
                host: customer.host,
                integrations: BTreeMap::new(),
            };

            for integration in customer.integrations {
                let ty: IntegrationType = integration.kind.parse().map_err(|e| {
                    invalid(format!("customer '{}': {}", customer.name, e))
                })?;
                if spec.integrations.contains_key(&ty) {
                    return Err(invalid(format!(
                        "customer '{}' lists integration '{}' twice",
                        customer.name, ty
                    )));
                }
                if let Some(target) = &integration.target_url {
                    url::Url::parse(target).map_err(|e| {
                        invalid(format!(
                            "customer '{}' {}: bad target_url '{}': {}",
                            customer.name, ty, target, e
                        ))
                    })?;
                }

                let mut credentials = BTreeMap::new();
                for (name, var) in integration.credentials {
                    match resolve(&var).filter(|v| !v.is_empty()) {
                        Some(value) => {
                            credentials.insert(name, SecretString::from(value));
                        }
                        None => tracing::warn!(
                            customer = %customer.name,
                            integration = %ty,
                            credential = %name,
                            env = %var,
                            "Credential environment variable is not set"
                        ),
                    }
                }

                spec.integrations.insert(
                    ty,
                    IntegrationParams {
                        target_url: integration.target_url,
                        region: integration.region,
                        credentials,
                    },
                );
            }

            catalog.order.push(spec.name.clone());
            catalog.customers.insert(spec.name.clone(), Arc::new(spec));
        }

        if let Some(default) = &catalog.default
            && !catalog.customers.contains_key(default)
        {
            return Err(invalid(format!("default customer '{}' is not defined", default)));
        }

        Ok(catalog)
    }

    /// Build a catalog directly from specs (tests and embedding callers).
    pub fn from_customers(customers: impl IntoIterator<Item = CustomerSpec>) -> Self {
        let mut catalog = Self::default();
        for spec in customers {
            catalog.order.push(spec.name.clone());
            catalog.customers.insert(spec.name.clone(), Arc::new(spec));
        }
        catalog
    }

    pub fn customer(&self, name: &str) -> Option<Arc<CustomerSpec>> {
        self.customers.get(name).cloned()
    }

    /// The configured default, or the first customer in file order.
    pub fn default_customer(&self) -> Option<Arc<CustomerSpec>> {
        self.default
            .as_deref()
            .or(self.order.first().map(String::as_str))
            .and_then(|name| self.customer(name))
    }

    /// Customer names in file order.
    pub fn customer_names(&self) -> &[String] {
        &self.order
    }

    /// Parameters for one integration, or `None` when the customer is
    /// unknown or does not use it.
    pub fn integration(&self, customer: &str, ty: IntegrationType) -> Option<&IntegrationParams> {
        self.customers.get(customer)?.integration(ty)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Default catalog location, relative to the working directory.
pub fn default_catalog_path() -> PathBuf {
    PathBuf::from("integrations.json")
}
