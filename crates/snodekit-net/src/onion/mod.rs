//! Onion routing: the layered envelope, path maintenance and the request
//! transport built on both.

pub mod envelope;
pub mod paths;
pub mod transport;
