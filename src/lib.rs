//! # Skvil-Piertotum
//!
//! A small LAN message broker that lets autonomous coding-agent instances
//! exchange messages and share key-value context through a central hub.
//!
//! Two cooperating components:
//!
//! - **Broker**: the central server holding all state — registered agents,
//!   per-agent bounded FIFO queues with explicit acknowledgement, and a
//!   shared context store with quotas ([`broker`]).
//! - **Worker**: the sidecar embedded in each coding-agent terminal — an
//!   RPC client, a heartbeat ticker with automatic re-registration, and an
//!   optional autonomous processing loop that delegates incoming messages
//!   to the host's sampling capability ([`worker`]).

pub mod broker;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod time_provider;
pub mod worker;

pub use crate::broker::rest_api::create_app;
pub use crate::broker::state::BrokerState;
pub use crate::error::BrokerError;
pub use crate::worker::client::BrokerClient;
pub use crate::worker::lifecycle::WorkerRuntime;
