//! tlsproxy - A TLS-terminating reverse proxy
//!
//! - Domain groups with aliases parsed from the command line
//! - Exact-URL routing to one upstream per domain
//! - Per-host certificates chosen by SNI from an on-disk cache
//! - Plaintext listener for ACME HTTP-01 challenges and HTTPS redirects

pub mod certificate;
pub mod config;
pub mod domains;
pub mod error;
pub mod idle;
pub mod proxy;
pub mod router;

pub use certificate::{CertificateManager, HostPolicy};
pub use config::Args;
pub use domains::{DomainRecord, Domains};
pub use error::ConfigError;
pub use proxy::{ProxyConfig, ProxyServer, Timeouts};
pub use router::{RoutingTable, Scheme, Upstream};
