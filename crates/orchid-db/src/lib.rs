//! PostgreSQL models, connection pooling, and query functions for the
//! plan execution engine's durable state: integrations, plans, configs,
//! auth flows, execution audit trail, context bag, rolling statistics,
//! and the dead-letter mirror.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
