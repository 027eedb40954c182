//! Boot-time node identity
//!
//! Every agent records telemetry under a small integer node id that is
//! assigned once and persisted in the agent's state directory, so the id
//! survives restarts instead of being derived from transient execution
//! context such as the current CPU.

use crate::models::NodeId;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// File name holding the persisted id inside the state directory
pub const NODE_ID_FILE: &str = "node-id";

/// Identity of the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
}

impl NodeIdentity {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Resolve the node id: an explicit override wins, then the persisted
    /// id, then an id derived from the node name which is persisted for
    /// the next start.
    pub async fn load_or_assign(
        state_dir: &Path,
        node_name: &str,
        override_id: Option<u32>,
        capacity: usize,
    ) -> Result<Self> {
        if let Some(id) = override_id {
            info!(node = %node_name, node_id = id, "Using configured node id");
            return Ok(Self::new(NodeId(id), node_name));
        }

        let path = state_dir.join(NODE_ID_FILE);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let id: u32 = content
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid node id in {:?}", path))?;
                info!(node = %node_name, node_id = id, "Loaded persisted node id");
                return Ok(Self::new(NodeId(id), node_name));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {:?}", path));
            }
        }

        let id = derive_node_id(node_name, capacity);
        fs::create_dir_all(state_dir)
            .await
            .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
        if let Err(e) = fs::write(&path, format!("{}\n", id.0)).await {
            // Derivation is deterministic, so an unwritable state dir only
            // loses the pinning, not the stability of the id.
            warn!(error = %e, path = ?path, "Failed to persist node id");
        } else {
            info!(node = %node_name, node_id = id.0, "Assigned and persisted node id");
        }

        Ok(Self::new(id, node_name))
    }
}

/// Derive an id in `[0, capacity)` from the node name
pub fn derive_node_id(node_name: &str, capacity: usize) -> NodeId {
    let digest = Sha256::digest(node_name.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let capacity = capacity.clamp(1, u32::MAX as usize) as u32;
    NodeId(prefix % capacity)
}
