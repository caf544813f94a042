//! Backend server tracking.
//!
//! # Architecture
//!
//! ```text
//! ServerConfig / discovery endpoint
//!       │
//!       ▼
//! parse_server_list (discovery)   ──►  ServerDescriptor (normalized address)
//!       │
//!       ▼
//! ServerRegistry (atomic list swap, round-robin cursor, change signal, failover)
//!       │
//!       ▼
//! RpcClient (picks servers for connect and switch)
//! ```

mod descriptor;
mod discovery;
mod registry;

pub use descriptor::ServerDescriptor;
pub use discovery::{SERVER_LIST_PATH, parse_server_list, server_list_url};
pub use registry::{SINGLE_SERVER_RETRY_TIMES, ServerRegistry};
