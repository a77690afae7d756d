use std::fmt;
use std::sync::Arc;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::connection::{close_channel, ConnectionFactory};
use crate::errors::{AmqpError, AmqpResult};

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_JSON: &str = "application/json";

/// A message body together with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Converts between payload values and broker messages.
pub trait MessageConverter: Send + Sync + fmt::Debug {
    fn to_message(&self, payload: &Value) -> AmqpResult<Message>;

    fn from_message(&self, message: &Message) -> AmqpResult<Value>;
}

/// Sends strings as UTF-8 text and nothing else.
#[derive(Debug, Default)]
pub struct SimpleMessageConverter;

impl MessageConverter for SimpleMessageConverter {
    fn to_message(&self, payload: &Value) -> AmqpResult<Message> {
        match payload {
            Value::String(text) => Ok(Message {
                body: text.as_bytes().to_vec(),
                content_type: TEXT_PLAIN.to_string(),
            }),
            other => Err(AmqpError::ConversionError(format!(
                "SimpleMessageConverter only handles strings, got {}",
                other
            ))),
        }
    }

    fn from_message(&self, message: &Message) -> AmqpResult<Value> {
        String::from_utf8(message.body.clone())
            .map(Value::String)
            .map_err(|e| AmqpError::ConversionError(e.to_string()))
    }
}

/// Serializes every payload as JSON.
#[derive(Debug, Default)]
pub struct JsonMessageConverter;

impl MessageConverter for JsonMessageConverter {
    fn to_message(&self, payload: &Value) -> AmqpResult<Message> {
        Ok(Message {
            body: serde_json::to_vec(payload)?,
            content_type: APPLICATION_JSON.to_string(),
        })
    }

    fn from_message(&self, message: &Message) -> AmqpResult<Value> {
        Ok(serde_json::from_slice(&message.body)?)
    }
}

/// Publishes messages through a connection factory.
#[derive(Debug)]
pub struct RabbitTemplate {
    connection_factory: Arc<dyn ConnectionFactory>,
    message_converter: Arc<dyn MessageConverter>,
    exchange: String,
    routing_key: String,
}

impl RabbitTemplate {
    /// Template on the default exchange using the [`SimpleMessageConverter`].
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        RabbitTemplate {
            connection_factory,
            message_converter: Arc::new(SimpleMessageConverter),
            exchange: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn with_message_converter(mut self, converter: Arc<dyn MessageConverter>) -> Self {
        self.message_converter = converter;
        self
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_string();
        self
    }

    pub fn connection_factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connection_factory
    }

    pub fn message_converter(&self) -> &Arc<dyn MessageConverter> {
        &self.message_converter
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Publishes `message` and waits for the broker to confirm it.
    pub async fn send(&self, exchange: &str, routing_key: &str, message: Message) -> AmqpResult<()> {
        let connection = self.connection_factory.create_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AmqpError::ChannelError(e.to_string()))?;

        let result = publish_confirmed(&channel, exchange, routing_key, &message).await;
        close_channel(&channel, "Publish complete").await;
        result?;

        info!(
            "Published message to exchange '{}' with routing key '{}'",
            exchange, routing_key
        );
        Ok(())
    }

    /// Converts `payload` and sends it to the template's exchange under `routing_key`.
    pub async fn convert_and_send(&self, routing_key: &str, payload: &Value) -> AmqpResult<()> {
        let message = self.message_converter.to_message(payload)?;
        self.send(&self.exchange, routing_key, message).await
    }

    /// Converts `payload` and sends it to the template's exchange and routing key.
    pub async fn convert_and_send_default(&self, payload: &Value) -> AmqpResult<()> {
        self.convert_and_send(&self.routing_key, payload).await
    }
}

async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    message: &Message,
) -> AmqpResult<()> {
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| AmqpError::ChannelError(format!("Failed to enable publisher confirms: {}", e)))?;

    let properties = BasicProperties::default()
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_content_type(message.content_type.clone().into());

    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &message.body,
            properties,
        )
        .await
        .map_err(|e| AmqpError::PublishError(e.to_string()))?
        .await
        .map_err(|e| AmqpError::PublishError(e.to_string()))?;

    check_confirmation(&confirmation, exchange, routing_key)
}

fn check_confirmation(confirmation: &Confirmation, exchange: &str, routing_key: &str) -> AmqpResult<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(AmqpError::PublishError(format!(
            "Broker rejected message for exchange '{}' with routing key '{}'",
            exchange, routing_key
        ))),
        Confirmation::NotRequested => Err(AmqpError::PublishError(
            "Publisher confirms are not enabled on the channel".to_string(),
        )),
    }
}

/// Destination-oriented facade over a [`RabbitTemplate`].
#[derive(Debug)]
pub struct RabbitMessagingTemplate {
    rabbit_template: Arc<RabbitTemplate>,
    default_destination: Option<String>,
}

impl RabbitMessagingTemplate {
    pub fn new(rabbit_template: Arc<RabbitTemplate>) -> Self {
        RabbitMessagingTemplate {
            rabbit_template,
            default_destination: None,
        }
    }

    pub fn with_default_destination(mut self, destination: &str) -> Self {
        self.default_destination = Some(destination.to_string());
        self
    }

    pub fn rabbit_template(&self) -> &Arc<RabbitTemplate> {
        &self.rabbit_template
    }

    pub fn default_destination(&self) -> Option<&str> {
        self.default_destination.as_deref()
    }

    /// Sends to `destination`, or to the default destination when none is given.
    pub async fn convert_and_send(&self, destination: Option<&str>, payload: &Value) -> AmqpResult<()> {
        let destination = destination
            .or(self.default_destination.as_deref())
            .ok_or_else(|| AmqpError::PublishError("No destination specified".to_string()))?;
        self.rabbit_template.convert_and_send(destination, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::CachingConnectionFactory;
    use serde_json::json;

    #[test]
    fn simple_converter_handles_text_only() {
        let converter = SimpleMessageConverter;
        let message = converter.to_message(&json!("hello")).unwrap();
        assert_eq!(message.body, b"hello");
        assert_eq!(message.content_type, TEXT_PLAIN);
        assert_eq!(converter.from_message(&message).unwrap(), json!("hello"));
        assert!(matches!(
            converter.to_message(&json!({"a": 1})),
            Err(AmqpError::ConversionError(_))
        ));
    }

    #[test]
    fn json_converter_serializes_any_value() {
        let converter = JsonMessageConverter;
        let payload = json!({"order_id": "42", "items": ["a", "b"]});
        let message = converter.to_message(&payload).unwrap();
        assert_eq!(message.content_type, APPLICATION_JSON);
        assert_eq!(converter.from_message(&message).unwrap(), payload);
    }

    #[test]
    fn template_keeps_its_collaborators() {
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(CachingConnectionFactory::new("localhost", 5672));
        let converter: Arc<dyn MessageConverter> = Arc::new(JsonMessageConverter);
        let template = RabbitTemplate::new(factory.clone())
            .with_message_converter(converter.clone())
            .with_exchange("orders")
            .with_routing_key("created");
        assert!(Arc::ptr_eq(template.connection_factory(), &factory));
        assert!(Arc::ptr_eq(template.message_converter(), &converter));
        assert_eq!(template.exchange(), "orders");
        assert_eq!(template.routing_key(), "created");
    }

    #[test]
    fn only_an_ack_counts_as_a_successful_publish() {
        assert!(check_confirmation(&Confirmation::Ack(None), "orders", "created").is_ok());
        let nack = check_confirmation(&Confirmation::Nack(None), "orders", "created").unwrap_err();
        assert!(nack.to_string().contains("orders"));
        assert!(matches!(
            check_confirmation(&Confirmation::NotRequested, "orders", "created"),
            Err(AmqpError::PublishError(_))
        ));
    }

    #[tokio::test]
    #[ignore] // requires a running RabbitMQ broker on localhost:5672
    async fn default_send_uses_the_configured_routing_key() {
        let factory = Arc::new(CachingConnectionFactory::new("localhost", 5672));
        let template = RabbitTemplate::new(factory.clone()).with_routing_key("rabbit_autoconfig_template_test");
        template.convert_and_send_default(&json!("hello")).await.unwrap();
        factory.close().await.unwrap();
    }

    #[tokio::test]
    async fn messaging_template_needs_a_destination() {
        let factory = Arc::new(CachingConnectionFactory::new("localhost", 5672));
        let template = Arc::new(RabbitTemplate::new(factory));
        let messaging = RabbitMessagingTemplate::new(template);
        assert_eq!(messaging.default_destination(), None);
        let err = messaging.convert_and_send(None, &json!("x")).await.unwrap_err();
        assert!(matches!(err, AmqpError::PublishError(_)));
    }
}
