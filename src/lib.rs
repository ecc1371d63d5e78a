//! pubgate - HTTP to MQTT publish gateway
//!
//! Accepts `POST /publish` requests and forwards them to an MQTT broker.
//! Every caller identity (HTTP Basic credentials, or anonymous) gets its own
//! pooled broker connection, created on first use and evicted when the
//! broker drops it or a publish over it fails.

pub mod client;
pub mod config;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod pool;

pub use client::{BrokerConnection, ClientError, Connector, MqttConnector};
pub use config::Config;
pub use http::{AppState, HttpServer};
pub use identity::Identity;
pub use pool::{ConnectionPool, PoolConfig, PoolError};
