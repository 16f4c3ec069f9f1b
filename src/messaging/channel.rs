use lapin::{
    Channel, Connection,
    options::{BasicQosOptions, ConfirmSelectOptions},
};
use tracing::{debug, error, info};

pub struct ChannelProvider;

impl ChannelProvider {
    pub async fn create_channel(connection: &Connection) -> Result<Channel, ChannelError> {
        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        debug!(channel_id = channel.id(), "Channel created successfully");
        Ok(channel)
    }

    /// Channel that holds at most `prefetch_count` unacknowledged deliveries.
    pub async fn create_consumer_channel(
        connection: &Connection,
        prefetch_count: u16,
    ) -> Result<Channel, ChannelError> {
        let channel = Self::create_channel(connection).await?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        info!(
            channel_id = channel.id(),
            prefetch_count,
            "Channel QoS configured successfully"
        );

        Ok(channel)
    }

    /// Channel in publisher-confirm mode, so each publish resolves to a broker ack or nack.
    pub async fn create_publisher_channel(connection: &Connection) -> Result<Channel, ChannelError> {
        let channel = Self::create_channel(connection).await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to enable publisher confirms");
                ChannelError::ConfirmSelectFailed(e.to_string())
            })?;

        Ok(channel)
    }

    pub async fn close_channel(channel: &Channel) -> Result<(), ChannelError> {
        let channel_id = channel.id();
        if !channel.status().connected() {
            debug!(channel_id, "Channel already closed");
            return Ok(());
        }

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        debug!(channel_id, "Channel closed successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmSelectFailed(String),

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}
