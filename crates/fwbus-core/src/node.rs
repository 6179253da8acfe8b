//! Bus generation tracker.
//!
//! Node IDs are only meaningful together with the generation they were
//! assigned in. The tracker is the single writer of that pair; everyone else
//! reads an immutable `NodeSnapshot` and captures its generation once per
//! operation.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::protocol::{ConfigRom, ConfigRomError, NODE_PHYSICAL_ID_MASK};
use crate::sync::{read, write};

/// Topology of the local node as of one bus generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node ID of the node this handle is bound to.
    pub node_id: u16,
    /// Node ID of the local controller.
    pub local_node_id: u16,
    pub root_node_id: u16,
    pub bus_manager_node_id: u16,
    pub ir_manager_node_id: u16,
    pub generation: u32,
    /// Raw big-endian configuration ROM image.
    pub config_rom: Vec<u8>,
}

impl NodeSnapshot {
    pub fn config_rom(&self) -> Result<ConfigRom, ConfigRomError> {
        ConfigRom::from_bytes(&self.config_rom)
    }

    pub fn is_local(&self) -> bool {
        self.node_id == self.local_node_id
    }

    pub fn is_root(&self) -> bool {
        self.node_id == self.root_node_id
    }
}

/// Physical ID part of a node ID.
pub fn physical_id(node_id: u16) -> u16 {
    node_id & NODE_PHYSICAL_ID_MASK
}

/// Serial-number comparison of generations, tolerant to wrap-around.
pub fn generation_is_newer(current: u32, candidate: u32) -> bool {
    let diff = candidate.wrapping_sub(current);
    diff != 0 && diff < 0x8000_0000
}

/// Single writer of generation and node-ID state.
#[derive(Debug)]
pub struct GenerationTracker {
    current: RwLock<Arc<NodeSnapshot>>,
}

impl GenerationTracker {
    pub fn new(initial: NodeSnapshot) -> Self {
        info!(
            node_id = %format!("{:04X}", initial.node_id),
            generation = initial.generation,
            "Tracking bus"
        );
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current_generation(&self) -> u32 {
        read(&self.current).generation
    }

    /// Consistent view of all node IDs and the generation.
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        Arc::clone(&read(&self.current))
    }

    pub fn is_current(&self, generation: u32) -> bool {
        self.current_generation() == generation
    }

    /// Install the topology reported by a bus reset.
    ///
    /// Returns the installed snapshot for the caller to publish, or `None`
    /// when the report is not newer than the current generation.
    pub fn on_bus_reset(&self, next: NodeSnapshot) -> Option<Arc<NodeSnapshot>> {
        let mut current = write(&self.current);
        if !generation_is_newer(current.generation, next.generation) {
            if next.generation != current.generation {
                warn!(
                    current = current.generation,
                    reported = next.generation,
                    "Ignoring stale bus reset"
                );
            } else {
                debug!(generation = next.generation, "Duplicate bus reset");
            }
            return None;
        }

        info!(
            from = current.generation,
            to = next.generation,
            node_id = %format!("{:04X}", next.node_id),
            root = %format!("{:04X}", next.root_node_id),
            "Bus reset"
        );
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        Some(next)
    }
}
