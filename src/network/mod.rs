pub mod client;
pub mod server;

pub use client::CertAuthClient;
pub use server::CertAuthServer;
