//! HTTP node for a parameter server, and the matching client.
pub mod client;
pub mod routes;
