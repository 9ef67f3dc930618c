//! uia-bridge library
//!
//! Out-of-process execution and supervision for UI automation:
//! - Line-delimited JSON wire protocol and the worker transport
//! - Worker loop, operation registry and handlers over an automation backend
//! - Supervisor with deadlines, process-tree kill and crash recovery
//! - Typed request adapters and the MCP tool surface

pub mod backend;
pub mod config;
pub mod mcp;
pub mod requests;
pub mod supervisor;
pub mod transport;
pub mod worker;
