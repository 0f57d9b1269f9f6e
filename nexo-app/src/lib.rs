//! Nexo orchestration core.
//!
//! Connects business tenants to a one-connection-per-tenant messaging
//! platform and turns inbound end-user messages into outbound replies: static
//! rule-matched autoresponses on the fast path, debounced AI-generated
//! replies on the slow path. The public HTTP surface lives elsewhere and
//! consumes the [`gateway::Gateway`] operations.

pub mod config;
pub mod debounce;
pub mod gateway;
pub mod pipeline;
pub mod registry;
pub mod repo;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;
