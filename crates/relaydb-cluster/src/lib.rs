//! Distributed control plane for a replicated SQL middleware cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               Client (statements)                 │
//! ├──────────────────────────────────────────────────┤
//! │  ClusterNode                                      │
//! │   ├─ Messenger (framed, checksummed transport)   │
//! │   ├─ HealthMonitor (heartbeats, UP set)          │
//! │   ├─ ElectionEngine (Bully, CoordinatorView)     │
//! │   ├─ ReadBalancer (round-robin / least-loaded)   │
//! │   ├─ TwoPhaseCoordinator (writes, 2PC)           │
//! │   └─ Participant (locks, pinned sessions, log)   │
//! ├──────────────────────────────────────────────────┤
//! │  relaydb-core (backend seam, local replica)      │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod balance;
pub mod config;
pub mod election;
pub mod error;
pub mod frame;
pub mod health;
pub mod locks;
pub mod message;
pub mod node;
pub mod participant;
pub mod transport;
pub mod twopc;

pub use crate::balance::ReadBalancer;
pub use crate::config::{ClusterConfig, NodeDescriptor, NodeId, ReadStrategy};
pub use crate::election::{CoordinatorView, ViewSnapshot};
pub use crate::error::{ClusterError, ErrorCode, Result};
pub use crate::health::{HealthEvent, HealthMonitor, PeerStatus};
pub use crate::locks::{LockGrant, LockManager, LockMode};
pub use crate::message::{generate_txn_id, ClientReply, Envelope, MessageKind, Vote};
pub use crate::node::ClusterNode;
pub use crate::participant::Participant;
pub use crate::twopc::{Transaction, TwoPhaseCoordinator, TxnPhase};
