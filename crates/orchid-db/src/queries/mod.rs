pub mod auth_flows;
pub mod configs;
pub mod dead_letters;
pub mod integrations;
pub mod plan_context;
pub mod plan_executions;
pub mod plan_statistics;
pub mod plans;
