// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Dial or channel-open failure. Recoverable through the health monitor.
    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel is not available")]
    NotConnected,

    #[error("RabbitMQ conflict: {0}")]
    Conflict(String),

    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("Invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: &'static str },

    #[error("RabbitMQ broker operation failed: {0}")]
    BrokerOperation(String),

    #[error("Connection supervisor is shutting down")]
    ShuttingDown,

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Classify lapin errors by AMQP reply code rather than by message text
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    RabbitMQError::Conflict(amqp.get_message().as_str().to_string())
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    RabbitMQError::QueueNotFound(amqp.get_message().as_str().to_string())
                }
                _ => RabbitMQError::BrokerOperation(error.to_string()),
            },
            LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::NotConnected
            }
            LapinError::IOError(_) | LapinError::MissingHeartbeatError => {
                RabbitMQError::Connection(error.to_string())
            }
            _ => RabbitMQError::BrokerOperation(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{ChannelState, ConnectionState};

    #[test]
    fn closed_channel_maps_to_not_connected() {
        let error: RabbitMQError = LapinError::InvalidChannelState(ChannelState::Closed).into();
        assert!(matches!(error, RabbitMQError::NotConnected));

        let error: RabbitMQError =
            LapinError::InvalidConnectionState(ConnectionState::Closed).into();
        assert!(matches!(error, RabbitMQError::NotConnected));
    }

    #[test]
    fn missing_heartbeat_is_a_connectivity_error() {
        let error: RabbitMQError = LapinError::MissingHeartbeatError.into();
        assert!(matches!(error, RabbitMQError::Connection(_)));
    }
}
