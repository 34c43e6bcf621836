//! Watchtower daemon library.
//!
//! Environment-driven configuration and process hardening for the
//! `watchtower` binary.

pub mod config;
pub mod hardening;
