//! Dashgate - health monitoring and reverse proxying for a home-server dashboard
//!
//! This library provides the control core behind an application dashboard:
//! - Periodically probes each configured app and tracks its health
//! - Routes HTTP traffic to apps by path prefix or subdomain
//! - Terminates TLS with static certificates or automatic ACME certificates
//! - Mirrors the route table into a Caddyfile for an external gateway
//! - Serves a small JSON status API for the dashboard frontend

pub mod acme;
pub mod admin;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod proxy;
pub mod routing;
pub mod tls;

pub use error::{Error, Result};
