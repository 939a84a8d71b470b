//! # tether: probe runner for tether nodes
//!
//! Binary shell around [`tether_client`]. Loads a TOML configuration, sets up
//! logging, then drives a [`core::probe::Probe`] that keeps a client
//! connected, joins the configured rooms and issues the configured requests.
//!
//! ## Layout
//!
//! - [`config`]: configuration loading and validation (`logger`, `client`, `probe`)
//! - [`logger`]: `tracing` subscriber setup
//! - [`core`]: the probe itself

pub mod config;
pub mod core;
pub mod logger;
