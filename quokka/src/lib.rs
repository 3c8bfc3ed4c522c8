//! Quokka: a one-command, self-hosted mail server.
//!
//! The SMTP protocol lives in `quokka-smtp`; this crate owns the
//! configuration file, TLS material, the metrics endpoint and the wiring
//! that turns a [`Config`] into running listeners.

pub mod app;
pub mod config;
pub mod metrics;
pub mod tls;

pub use app::Quokka;
pub use config::{Config, ConfigError, DEFAULT_CONFIG_FILE};
pub use metrics::build_router;
