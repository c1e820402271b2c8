//! restfs shared library.

/// The local cache and its eviction daemon.
pub mod cache;
/// The client side: coherency, handles, the remote-backed adapter and its FUSE bridge.
pub mod fs;
pub mod io;
pub mod notify;
pub mod sandbox;
/// The server side.
pub mod server;
