//! Per-publish AMQP channels

use crate::protocol::EncodedMessage;
use crate::transport::{PublishChannel, PublishRoute, TransportError};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel};
use tracing::debug;

/// A confirm-mode channel used for a single publish
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub(super) async fn open(channel: Channel) -> Result<Self, TransportError> {
        if let Err(e) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            let _ = channel.close(200, "confirm select failed").await;
            return Err(TransportError::ChannelFailed(e.to_string()));
        }
        debug!(channel_id = channel.id(), "Opened publish channel");
        Ok(Self { channel })
    }
}

/// Broker-visible properties celery expects on a task message
pub fn message_properties(message: &EncodedMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(message.content_type.into())
        .with_content_encoding(message.content_encoding.into())
        .with_delivery_mode(message.delivery_mode)
        .with_priority(message.priority)
        .with_message_id(message.message_id.clone().into())
        .with_correlation_id(message.message_id.clone().into())
        .with_timestamp(message.timestamp)
}

#[async_trait]
impl PublishChannel for AmqpChannel {
    async fn publish(
        &self,
        route: &PublishRoute,
        message: &EncodedMessage,
    ) -> Result<(), TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message_properties(message),
            )
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(TransportError::PublishFailed(format!(
                "broker rejected message {}",
                message.message_id
            )));
        }
        Ok(())
    }

    async fn close(self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "publish complete")
            .await
            .map_err(|e| TransportError::CloseFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_task, Task};

    #[test]
    fn test_message_properties() {
        let task = Task::new("tasks.add").with_args(vec!["4".to_string(), "8".to_string()]);
        let message = encode_task(&task).unwrap();
        let properties = message_properties(&message);

        assert_eq!(
            properties.content_type().as_ref().map(|v| v.as_str()),
            Some("application/json")
        );
        assert_eq!(
            properties.content_encoding().as_ref().map(|v| v.as_str()),
            Some("utf-8")
        );
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(*properties.priority(), Some(0));
        assert_eq!(
            properties.message_id().as_ref().map(|v| v.as_str()),
            Some(message.message_id.as_str())
        );
        assert_eq!(*properties.timestamp(), Some(message.timestamp));
    }
}
