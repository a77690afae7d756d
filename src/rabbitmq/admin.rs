use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tracing::info;

use super::connection::{close_channel, ConnectionFactory};
use crate::errors::{AmqpError, AmqpResult};

/// Declares and removes broker topology.
#[async_trait]
pub trait AmqpAdmin: Send + Sync + fmt::Debug {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> AmqpResult<()>;

    async fn delete_exchange(&self, name: &str) -> AmqpResult<()>;

    /// Declares a durable queue and returns the number of messages it holds.
    async fn declare_queue(&self, name: &str) -> AmqpResult<u32>;

    /// Deletes a queue and returns the number of messages it held.
    async fn delete_queue(&self, name: &str) -> AmqpResult<u32>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> AmqpResult<()>;
}

#[derive(Debug)]
pub struct RabbitAdmin {
    connection_factory: Arc<dyn ConnectionFactory>,
}

impl RabbitAdmin {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        RabbitAdmin { connection_factory }
    }

    pub fn connection_factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connection_factory
    }

    /// Runs `operation` on a fresh channel and closes the channel whatever the outcome.
    async fn with_channel<T, F, Fut>(&self, operation: F) -> AmqpResult<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = AmqpResult<T>>,
    {
        let connection = self.connection_factory.create_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AmqpError::ChannelError(e.to_string()))?;
        let result = operation(channel.clone()).await;
        close_channel(&channel, "Admin operation complete").await;
        result
    }
}

#[async_trait]
impl AmqpAdmin for RabbitAdmin {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> AmqpResult<()> {
        self.with_channel(|channel| async move {
            channel
                .exchange_declare(
                    name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| AmqpError::ChannelError(format!("Failed to declare exchange: {}", e)))
        })
        .await?;
        info!("Exchange '{}' declared", name);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> AmqpResult<()> {
        self.with_channel(|channel| async move {
            channel
                .exchange_delete(name, ExchangeDeleteOptions::default())
                .await
                .map_err(|e| AmqpError::ChannelError(format!("Failed to delete exchange: {}", e)))
        })
        .await?;
        info!("Exchange '{}' deleted", name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> AmqpResult<u32> {
        let message_count = self
            .with_channel(|channel| async move {
                channel
                    .queue_declare(
                        name,
                        QueueDeclareOptions {
                            durable: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map(|queue| queue.message_count())
                    .map_err(|e| AmqpError::ChannelError(format!("Failed to declare queue: {}", e)))
            })
            .await?;
        info!("Queue '{}' declared with {} messages", name, message_count);
        Ok(message_count)
    }

    async fn delete_queue(&self, name: &str) -> AmqpResult<u32> {
        let purged = self
            .with_channel(|channel| async move {
                channel
                    .queue_delete(name, QueueDeleteOptions::default())
                    .await
                    .map_err(|e| AmqpError::ChannelError(format!("Failed to delete queue: {}", e)))
            })
            .await?;
        info!("Queue '{}' deleted", name);
        Ok(purged)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> AmqpResult<()> {
        self.with_channel(|channel| async move {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| AmqpError::ChannelError(format!("Failed to bind queue: {}", e)))
        })
        .await
    }
}
