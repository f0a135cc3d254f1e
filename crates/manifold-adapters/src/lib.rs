//! Manifold Adapters
//!
//! Real-world collaborators for the manifold core.
//!
//! # Code sources
//!
//! - `JsonRpcCodeSource`: `eth_getCode` over JSON-RPC with bounded retries
//!
//! # Build artifacts
//!
//! - `CompilerArtifactSource`: facet artifacts from a compiler output directory

pub mod artifacts;
pub mod rpc;

pub use artifacts::CompilerArtifactSource;
pub use rpc::JsonRpcCodeSource;
