//! Network primitive and the request/response values that flow through it.

pub mod client;
pub mod types;

pub use client::{HttpClient, Network};
pub use types::{Request, Response};
