//! AITF: Active Internet Traffic Filtering
//!
//! A cooperative DDoS-mitigation protocol: routers stamp forwarded
//! packets with authenticated route records, and victims use those
//! records to push traffic filters back toward the attacking host.

pub mod auth;
pub mod config;
pub mod engine;
pub mod filter;
pub mod protocol;
pub mod record;
pub mod shim;
pub mod transport;

// Re-export authentication types
pub use auth::{NonceAuthenticator, NONCE_SIZE};

// Re-export config types
pub use config::{Config, ConfigError, FiltersConfig};

// Re-export route record types
pub use record::{RouteRecord, RouterEntry};

// Re-export shim types
pub use shim::{Ipv4Header, ShimError, Verdict, SHIM_PROTOCOL};

// Re-export protocol types
pub use protocol::{
    FilterMessage, FlowClaim, MessageType, ProtocolError, AITF_PORT, MAX_DATAGRAM,
};

// Re-export filter types
pub use filter::{
    ActiveFilter, FilterError, FilterTable, FirewallDriver, IptablesDriver, LONG_FILTER_MS,
};

// Re-export engine types
pub use engine::{
    ComplianceMode, HostEngine, Outbound, PendingHandshakes, RouterEngine, ShadowFilters, Timings,
};

// Re-export transport types
pub use transport::{FilterTransport, ReceivedDatagram, TransportError};
