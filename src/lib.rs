//! Multi-node test harness for a DHT's content-provider advertisement and
//! discovery functions.
//!
//! The harness brings up a configurable number of peer nodes wired into one
//! overlay, exposes a JSON-RPC control plane that targets operations at a
//! node by host index, and verifies that identifiers announced by one node
//! are discoverable from every other node, either autonomously (each node
//! ticking its own provide/lookup rounds) or under an external driver.
//!
//! The DHT itself is the external kademlia module; this crate only
//! orchestrates and verifies it.

pub mod config;
pub mod content;
pub mod fleet;
pub mod identity;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod tester;

mod swarm;

pub use crate::config::{ConfigError, HarnessConfig};
pub use crate::content::ContentId;
pub use crate::fleet::{Fleet, FleetContext};
pub use crate::node::PeerNode;
pub use crate::registry::{AddrRecord, BootstrapRegistry};
pub use crate::swarm::EndpointError;
