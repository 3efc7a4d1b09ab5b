//! # Portcullis Core
//!
//! The per-request pipeline of the Portcullis gateway and the subsystems that
//! feed it:
//!
//! - **`store`** - datastore, immutable config snapshots, quota counters
//! - **`router`** - host+path resolution to a service descriptor
//! - **`gate`** - ordered access checks (IP filter, restrictions, JWT, API key, quotas, sessions)
//! - **`balancing`** - target predicates and the six load-balancing disciplines
//! - **`seccom`** - the signed state/claim exchange with upstreams
//! - **`forward`** - upstream clients, header rewriting, streaming, timeouts, retries
//! - **`stats`** - live per-service and global counters, cluster aggregation
//! - **`monitor`** - bounded ring of recent request logs
//! - **`events`** - fire-and-forget audit sink
//! - **`sessions`** - private-app session store
//! - **`server`** - the axum inbound surface wiring everything together
//!
//! Request handlers never hold global mutable state: everything flows through
//! an explicit [`env::GatewayEnv`] passed down the pipeline.

pub mod balancing;
pub mod env;
pub mod events;
pub mod forward;
pub mod gate;
pub mod monitor;
pub mod router;
pub mod seccom;
pub mod server;
pub mod sessions;
pub mod stats;
pub mod store;
pub mod template;

pub use env::{GatewayEnv, InstancePosition};
pub use server::build_gateway_router;
