//! Dispatch protocol.
//!
//! A coordinator posts a list of target [`Node`]s to a peer's `/dispatch`
//! endpoint. The peer floods every target in turn, one at a time, stores each
//! result under the target's own address and answers with the populated list.
//! A hard failure on any target fails the whole batch; there are no partial
//! results.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::Perf;
use crate::config::ProbeConfig;
use crate::flood::{ProbeError, TierRunner, TierSelector};
use crate::net;

/// A probe target and the measurements taken against it, keyed by the
/// address that was probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub addr: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub perf: HashMap<String, Perf>,
}

impl Node {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            perf: HashMap::new(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, Perf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, Perf>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed dispatch request: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("flood against {addr} failed: {source}")]
    Probe {
        addr: String,
        #[source]
        source: ProbeError,
    },

    #[error("failed to encode dispatch response: {0}")]
    Encode(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Peer side
// ---------------------------------------------------------------------------

/// Run the tier ladder against each node sequentially.
pub async fn measure_targets<R: TierRunner>(
    selector: &TierSelector<R>,
    cancel: &CancellationToken,
    nodes: &mut [Node],
) -> Result<(), DispatchError> {
    for node in nodes.iter_mut() {
        let perf = selector
            .probe(cancel, &node.addr)
            .await
            .map_err(|source| DispatchError::Probe {
                addr: node.addr.clone(),
                source,
            })?;
        node.perf.insert(node.addr.clone(), perf);
    }
    Ok(())
}

/// Decode a posted batch, measure it, and encode the populated response.
pub async fn handle_batch<R: TierRunner>(
    selector: &TierSelector<R>,
    cancel: &CancellationToken,
    body: &[u8],
) -> Result<Vec<u8>, DispatchError> {
    let mut nodes: Vec<Node> = serde_json::from_slice(body).map_err(DispatchError::Decode)?;

    let batch = Uuid::new_v4();
    info!(%batch, targets = nodes.len(), "dispatch batch received");

    if let Err(e) = measure_targets(selector, cancel, &mut nodes).await {
        warn!(%batch, error = %e, "dispatch batch aborted");
        return Err(e);
    }

    info!(%batch, targets = nodes.len(), "dispatch batch complete");
    serde_json::to_vec(&nodes).map_err(DispatchError::Encode)
}

// ---------------------------------------------------------------------------
// Coordinator side
// ---------------------------------------------------------------------------

/// Coordinator-side client for a peer's `/dispatch` endpoint.
pub struct DispatchClient {
    client: reqwest::Client,
    peer_port: u16,
}

impl DispatchClient {
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            client: net::build_client(config.network.connect_timeout())?,
            peer_port: config.network.peer_port,
        })
    }

    /// Ask `peer` to flood `nodes`; on success `nodes` is replaced by the
    /// peer's populated copy.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        peer: &str,
        nodes: &mut Vec<Node>,
    ) -> Result<()> {
        let url = net::peer_url(peer, self.peer_port, "dispatch")?;
        info!(%peer, targets = nodes.len(), "dispatching flood batch");

        let request = async {
            let resp = self
                .client
                .post(&url)
                .json(&*nodes)
                .send()
                .await
                .with_context(|| format!("failed to reach peer {}", peer))?;
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .with_context(|| format!("failed to read dispatch response from {}", peer))?;

            if !status.is_success() {
                anyhow::bail!(
                    "peer {} rejected dispatch ({}): {}",
                    peer,
                    status,
                    String::from_utf8_lossy(&body).trim()
                );
            }

            let populated: Vec<Node> = serde_json::from_slice(&body)
                .with_context(|| format!("malformed dispatch response from {}", peer))?;
            Ok::<_, anyhow::Error>(populated)
        };

        let populated = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("dispatch to {} cancelled", peer),
            res = request => res?,
        };

        *nodes = populated;
        Ok(())
    }
}
