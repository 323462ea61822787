//! Client for a node's admin API

use crate::cluster::node::DomainId;
use crate::cluster::state::{ClusterStatus, DomainStatus, NodeStatus};
use crate::common::{retry_with_backoff, Error, Result};
use crate::migration::{MigrationKind, SessionSummary};
use crate::server::http::{
    AddNodeRequest, HostDomainRequest, MigrationRequest, MigrationStarted, StatusChangeRequest,
    ThresholdRequest,
};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

pub struct AdminClient {
    base_url: String,
    client: Client,
    attempts: usize,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            attempts: 3,
        })
    }

    /// Total tries for requests that fail with a retryable error
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        retry_with_backoff(
            || async {
                let response = build().send().await?;
                check(response).await
            },
            self.attempts,
            INITIAL_BACKOFF,
        )
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(|| self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(|| self.request(Method::POST, path).json(body))
            .await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get("/health").await
    }

    pub async fn metrics(&self) -> Result<String> {
        let response = self.send(|| self.request(Method::GET, "/metrics")).await?;
        Ok(response.text().await?)
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        self.get("/admin/status").await
    }

    pub async fn domains(&self) -> Result<Vec<DomainStatus>> {
        self.get("/admin/domains").await
    }

    pub async fn domain(&self, domain: DomainId) -> Result<DomainStatus> {
        self.get(&format!("/admin/domains/{}", domain)).await
    }

    pub async fn host_domain(&self, domain: DomainId, replication_factor: u32) -> Result<()> {
        self.post(
            &format!("/admin/domains/{}/host", domain),
            &HostDomainRequest { replication_factor },
        )
        .await?;
        Ok(())
    }

    pub async fn delete_domain(&self, domain: DomainId) -> Result<()> {
        let path = format!("/admin/domains/{}", domain);
        self.send(|| self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    pub async fn node(&self, addr: &str) -> Result<NodeStatus> {
        self.get(&format!("/admin/nodes/{}", addr)).await
    }

    pub async fn add_node(&self, address: &str) -> Result<()> {
        self.post(
            "/admin/nodes",
            &AddNodeRequest {
                address: address.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_node(&self, addr: &str) -> Result<()> {
        let path = format!("/admin/nodes/{}", addr);
        self.send(|| self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    pub async fn set_local_active(&self, active: bool) -> Result<()> {
        let path = if active {
            "/admin/local/active"
        } else {
            "/admin/local/inactive"
        };
        self.send(|| self.request(Method::POST, path)).await?;
        Ok(())
    }

    pub async fn set_heavy_load_threshold(&self, threshold: f64) -> Result<()> {
        self.post("/admin/heavy-load-threshold", &ThresholdRequest { threshold })
            .await?;
        Ok(())
    }

    pub async fn exchange_mapping(&self) -> Result<()> {
        self.send(|| self.request(Method::POST, "/admin/exchange-mapping"))
            .await?;
        Ok(())
    }

    /// Tear the node's cluster view down to itself
    pub async fn reset_cluster(&self) -> Result<()> {
        self.send(|| self.request(Method::POST, "/admin/reset"))
            .await?;
        Ok(())
    }

    pub async fn set_status_change_allow(&self, allow: bool) -> Result<()> {
        self.post("/admin/status-change", &StatusChangeRequest { allow })
            .await?;
        Ok(())
    }

    pub async fn migrations(&self) -> Result<Vec<SessionSummary>> {
        self.get("/admin/migrations").await
    }

    pub async fn start_migration(
        &self,
        domain: DomainId,
        destination: &str,
        kind: MigrationKind,
    ) -> Result<MigrationStarted> {
        let response = self
            .post(
                "/admin/migrations",
                &MigrationRequest {
                    domain,
                    destination: destination.to_string(),
                    kind,
                },
            )
            .await?;
        Ok(response.json().await?)
    }
}

/// Turn an error answer into [`Error::Api`] with the server's message
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => status.to_string(),
    };
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}
