//! Result and session-metadata storage.
//!
//! One contract ([`StoreAdapter`]), two implementations: a local in-process
//! adapter with optional JSON file persistence, and a remote adapter
//! talking to a backend over HTTP. Expiry is lazy — enforced on read, with
//! an opportunistic sweep on every write.

pub mod adapter;
pub mod http;
pub mod local;

pub use adapter::StoreAdapter;
pub use http::HttpStoreAdapter;
pub use local::LocalStoreAdapter;
