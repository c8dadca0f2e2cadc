//! Sandpool library
//!
//! Control plane for warm pools of VM-isolated sandbox and MCP-server
//! workloads on Kubernetes. State lives on the orchestrator; replicas are
//! stateless and coordinate through optimistic-concurrency writes and a
//! leader lease.

pub mod config;
pub mod error;
pub mod exec;
pub mod labels;
pub mod leader;
pub mod mcp;
pub mod ondemand;
pub mod pool;
pub mod reconcile;
pub mod terminal;
pub mod workload;
