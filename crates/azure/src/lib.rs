//! Natsync Azure adapter – [`FirewallStore`] over the management REST API.
//!
//! Credential acquisition stays outside: callers hand in a [`TokenProvider`]
//! and this crate only attaches the bearer token it is given. Reads and
//! writes address one firewall object; the PUT is a full replace of the
//! body the GET returned, which is exactly the contract the reconciler's
//! merge step relies on.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use natsync_core::RemoteFirewallState;
use natsync_store::{FirewallAddress, FirewallStore};
use tracing::debug;

/// Management API version pinned for both read and write.
pub const API_VERSION: &str = "2023-09-01";

const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

/// Supplies a current bearer token per request. Tokens expire, so this is a
/// callback rather than a captured string.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String>;
}

/// Token read from an environment variable on every request.
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn bearer_token(&self) -> Result<String> {
        std::env::var(&self.var).with_context(|| format!("reading bearer token from ${}", self.var))
    }
}

pub struct AzureFirewallStore<T> {
    http: reqwest::Client,
    endpoint: String,
    address: FirewallAddress,
    token: T,
}

impl<T: TokenProvider> AzureFirewallStore<T> {
    pub fn new(address: FirewallAddress, token: T) -> Self {
        Self { http: reqwest::Client::new(), endpoint: DEFAULT_ENDPOINT.to_string(), address, token }
    }

    /// Point at a different management endpoint (sovereign clouds, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn resource_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/azureFirewalls/{}?api-version={}",
            self.endpoint,
            self.address.subscription,
            self.address.resource_group,
            self.address.firewall,
            API_VERSION
        )
    }
}

#[async_trait]
impl<T: TokenProvider> FirewallStore for AzureFirewallStore<T> {
    async fn read(&self) -> Result<RemoteFirewallState> {
        let url = self.resource_url();
        debug!(firewall = %self.address, "fetching firewall state");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(self.token.bearer_token()?)
            .send()
            .await
            .with_context(|| format!("GET {}", self.address))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} returned {}: {}", self.address, status, truncate(&body)));
        }
        resp.json::<RemoteFirewallState>()
            .await
            .with_context(|| format!("decoding firewall state for {}", self.address))
    }

    async fn write(&self, state: &RemoteFirewallState) -> Result<()> {
        let url = self.resource_url();
        debug!(firewall = %self.address, "replacing firewall state");
        let resp = self
            .http
            .put(&url)
            .bearer_auth(self.token.bearer_token()?)
            .json(state)
            .send()
            .await
            .with_context(|| format!("PUT {}", self.address))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("PUT {} returned {}: {}", self.address, status, truncate(&body)));
        }
        Ok(())
    }
}

fn truncate(body: &str) -> &str {
    // Error payloads can be large; keep log lines bounded.
    let max = 512;
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
