//! cqlgate: an intercepting proxy for the CQL native protocol.
//!
//! The proxy sits between CQL drivers and a backing cluster. It answers
//! protocol negotiation and `system.local` / `system.peers` reads itself,
//! so drivers discover exactly one node (the proxy), and forwards all other
//! traffic over lazily-created per-keyspace backend sessions.

pub mod cluster;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod parse;
pub mod proxy;
pub mod registry;
pub mod system;
pub mod worker;

pub use error::{ProxyError, Result};
pub use proxy::{Proxy, ProxyConfig};
