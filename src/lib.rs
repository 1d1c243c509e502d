//! Gatekeeper - Per-Client Request Admission
//!
//! This crate implements a request-admission filter for HTTP services: a
//! client whose previous request was admitted less than one window ago is
//! answered with `429 Too Many Requests` instead of reaching the handler.
//! State is kept in-process, sharded by client key.

pub mod admission;
pub mod config;
pub mod error;
pub mod web;
