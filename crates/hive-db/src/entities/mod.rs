pub mod audit_events;
pub mod instance_ai_agents;
pub mod instance_usage_stats;
pub mod instances;
pub mod user_instance_assignments;
pub mod users;
