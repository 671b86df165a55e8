//! A format-transforming encryption tunnel.
//!
//! Two proxies carry an arbitrary TCP byte stream inside strings of a
//! configurable regular language: plaintext is authenticated-encrypted into
//! fixed-expansion cells, each cell is ranked into the language's
//! fixed-length word slice, and the peer runs the whole thing backwards.
pub mod client;
pub mod config;
pub mod defs;
pub mod dfa;
pub mod encoder;
pub mod encrypter;
pub mod errors;
pub mod negotiate;
pub mod net;
pub mod record;
pub mod relay;
pub mod server;

pub use errors::Error;
