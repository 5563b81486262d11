//! Self-signed client certificate issuance and thumbprint-based request validation
//! for mutual TLS between a console client and an HTTP service.

pub mod config;
pub mod network;
pub mod pki;
