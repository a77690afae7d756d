use std::fmt;
use std::sync::Arc;

use crate::rabbitmq::{
    AmqpAdmin, ConnectionFactory, ListenerContainerFactory, ListenerEndpointProcessor,
    ListenerEndpointRegistry, MessageConverter, RabbitMessagingTemplate, RabbitTemplate,
};

/// The fixed set of components the resolver knows how to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    ConnectionFactory,
    MessageConverter,
    Template,
    MessagingTemplate,
    Admin,
    ListenerContainerFactory,
    ListenerAnnotationProcessor,
    ListenerEndpointRegistry,
}

impl Role {
    /// Dependencies come before their dependents.
    pub const RESOLUTION_ORDER: [Role; 8] = [
        Role::ConnectionFactory,
        Role::MessageConverter,
        Role::Template,
        Role::MessagingTemplate,
        Role::Admin,
        Role::ListenerContainerFactory,
        Role::ListenerAnnotationProcessor,
        Role::ListenerEndpointRegistry,
    ];

    /// Name a default for this role is registered under.
    pub fn conventional_name(self) -> &'static str {
        match self {
            Role::ConnectionFactory => "rabbit_connection_factory",
            Role::MessageConverter => "rabbit_message_converter",
            Role::Template => "rabbit_template",
            Role::MessagingTemplate => "rabbit_messaging_template",
            Role::Admin => "amqp_admin",
            Role::ListenerContainerFactory => "rabbit_listener_container_factory",
            Role::ListenerAnnotationProcessor => "rabbit_listener_annotation_processor",
            Role::ListenerEndpointRegistry => "rabbit_listener_endpoint_registry",
        }
    }

    pub fn is_listener_infrastructure(self) -> bool {
        matches!(
            self,
            Role::ListenerContainerFactory
                | Role::ListenerAnnotationProcessor
                | Role::ListenerEndpointRegistry
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::ConnectionFactory => "connection factory",
            Role::MessageConverter => "message converter",
            Role::Template => "rabbit template",
            Role::MessagingTemplate => "messaging template",
            Role::Admin => "amqp admin",
            Role::ListenerContainerFactory => "listener container factory",
            Role::ListenerAnnotationProcessor => "listener annotation processor",
            Role::ListenerEndpointRegistry => "listener endpoint registry",
        };
        f.write_str(name)
    }
}

/// A constructed singleton held by the registry.
#[derive(Debug, Clone)]
pub enum Component {
    ConnectionFactory(Arc<dyn ConnectionFactory>),
    MessageConverter(Arc<dyn MessageConverter>),
    Template(Arc<RabbitTemplate>),
    MessagingTemplate(Arc<RabbitMessagingTemplate>),
    Admin(Arc<dyn AmqpAdmin>),
    ListenerContainerFactory(Arc<dyn ListenerContainerFactory>),
    ListenerAnnotationProcessor(Arc<ListenerEndpointProcessor>),
    ListenerEndpointRegistry(Arc<ListenerEndpointRegistry>),
}

impl Component {
    pub fn role(&self) -> Role {
        match self {
            Component::ConnectionFactory(_) => Role::ConnectionFactory,
            Component::MessageConverter(_) => Role::MessageConverter,
            Component::Template(_) => Role::Template,
            Component::MessagingTemplate(_) => Role::MessagingTemplate,
            Component::Admin(_) => Role::Admin,
            Component::ListenerContainerFactory(_) => Role::ListenerContainerFactory,
            Component::ListenerAnnotationProcessor(_) => Role::ListenerAnnotationProcessor,
            Component::ListenerEndpointRegistry(_) => Role::ListenerEndpointRegistry,
        }
    }
}
