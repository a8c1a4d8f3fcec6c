//! Snapserver client list
//!
//! Queries `Server.GetStatus` over the snapserver's HTTP JSON-RPC endpoint and
//! flattens its groups into one client list for the UI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::StatusPollCollaborator;
use crate::bus::{BroadcastHub, Envelope, Topic};
use crate::error::bounded;
use crate::notifier::SourceChangeHandler;

pub const SNAPCAST_TOPIC: &str = "snapcast";

const SNAPCAST_REQUEST_ID: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapClient {
    pub id: String,
    pub host: String,
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    groups: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    #[serde(default)]
    clients: Vec<RawClient>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
    id: String,
    #[serde(default)]
    connected: bool,
    host: RawHost,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    #[serde(default)]
    name: String,
}

/// Flatten a `Server.GetStatus` result into clients, in group order
pub fn parse_clients(result: &Value) -> Result<Vec<SnapClient>> {
    let server: RawServer = serde_json::from_value(
        result
            .get("server")
            .cloned()
            .ok_or_else(|| anyhow!("Server.GetStatus result has no server"))?,
    )?;
    Ok(server
        .groups
        .into_iter()
        .flat_map(|group| group.clients)
        .map(|client| SnapClient {
            id: client.id,
            host: client.host.name,
            connected: client.connected,
        })
        .collect())
}

// =============================================================================
// SnapcastClient
// =============================================================================

pub struct SnapcastClient {
    client: Client,
    url: String,
}

impl SnapcastClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{}:{}/jsonrpc", host, port),
        })
    }

    async fn rpc(&self, method: &str) -> Result<Value> {
        let body = json!({
            "id": SNAPCAST_REQUEST_ID,
            "jsonrpc": "2.0",
            "method": method,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("snapserver request failed: {}", response.status()));
        }
        let data: Value = response.json().await?;
        if let Some(error) = data.get("error") {
            if !error.is_null() {
                return Err(anyhow!("snapserver error: {}", error));
            }
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl StatusPollCollaborator for SnapcastClient {
    type Status = Vec<SnapClient>;

    async fn get_status(&self) -> Result<Vec<SnapClient>> {
        let result = self.rpc("Server.GetStatus").await?;
        parse_clients(&result)
    }
}

// =============================================================================
// SnapcastMonitor
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientsStatus {
    pub clients: Vec<SnapClient>,
    pub server_available: bool,
}

pub struct SnapcastMonitor {
    server: Arc<dyn StatusPollCollaborator<Status = Vec<SnapClient>>>,
    hub: Arc<BroadcastHub>,
    timeout: Duration,
    last: Mutex<ClientsStatus>,
}

impl SnapcastMonitor {
    pub fn new(
        server: Arc<dyn StatusPollCollaborator<Status = Vec<SnapClient>>>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            server,
            hub,
            timeout: Duration::from_secs(5),
            last: Mutex::new(ClientsStatus::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn status(&self) -> ClientsStatus {
        self.last.lock().clone()
    }

    /// Query the server and publish the result. An unreachable server
    /// publishes an empty list with `server_available: false`.
    pub async fn refresh(&self) -> ClientsStatus {
        let status = match bounded("snapcast status", self.timeout, self.server.get_status()).await
        {
            Ok(clients) => {
                debug!("Snapserver reports {} client(s)", clients.len());
                ClientsStatus {
                    clients,
                    server_available: true,
                }
            }
            Err(e) => {
                warn!("{}", e);
                ClientsStatus::default()
            }
        };

        {
            let mut last = self.last.lock();
            *last = status.clone();
        }

        let data = serde_json::to_value(&status).unwrap_or_default();
        self.hub
            .publish(&Topic::new(SNAPCAST_TOPIC), Envelope::new("clients_status", data));
        status
    }
}

#[async_trait]
impl SourceChangeHandler for SnapcastMonitor {
    fn name(&self) -> &str {
        SNAPCAST_TOPIC
    }

    async fn on_source_changed(&self, _old: Option<&str>, _new: Option<&str>) -> Result<()> {
        self.refresh().await;
        Ok(())
    }
}
