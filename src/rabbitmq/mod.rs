// src/rabbitmq/mod.rs
// Thin collaborators over lapin that the resolver builds and wires together

pub mod admin;
pub mod connection;
pub mod listener;
pub mod template;

pub use admin::{AmqpAdmin, RabbitAdmin};
pub use connection::{CachingConnectionFactory, ConnectionFactory};
pub use listener::{
    ContainerSettings, ListenerContainer, ListenerContainerFactory, ListenerEndpoint,
    ListenerEndpointProcessor, ListenerEndpointRegistry, ListenerHandler,
    SimpleListenerContainerFactory,
};
pub use template::{
    JsonMessageConverter, Message, MessageConverter, RabbitMessagingTemplate, RabbitTemplate,
    SimpleMessageConverter,
};
