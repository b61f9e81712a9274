//! Access to the league's remote data service.
//!
//! `RemoteSource` is the seam the sync engine talks through; `HttpRemote`
//! is the production implementation.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod source;

pub use client::HttpRemote;
pub use source::RemoteSource;
