pub mod config;
pub mod rabbitmq;

pub use rabbitmq::{RabbitMQError, Result, TenantBroker, TENANT_EXCHANGE};
