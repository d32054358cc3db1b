//! HTTP endpoint for probes and scraping
//!
//! Serves `/health` for kubelet probes and `/metrics` in the Prometheus text
//! format.

mod server;

pub use server::{router, run_server};
