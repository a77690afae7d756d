use std::sync::Arc;

use tracing::{debug, info};

use super::component::{Component, Role};
use super::definitions::Definitions;
use super::registry::{ComponentRegistry, Origin};
use crate::binder::RabbitProperties;
use crate::config::{PropertySet, DEFAULT_PREFIX};
use crate::errors::Result;
use crate::rabbitmq::{
    CachingConnectionFactory, ListenerEndpointProcessor, ListenerEndpointRegistry, RabbitAdmin,
    RabbitMessagingTemplate, RabbitTemplate, SimpleListenerContainerFactory,
};
use crate::transport::SocketFactory;

/// Turns properties and caller definitions into a frozen [`ComponentRegistry`].
///
/// Roles are visited in [`Role::RESOLUTION_ORDER`]. A role the caller declared
/// (under any name) gets the caller's components and no default.
#[derive(Debug, Clone)]
pub struct AutoConfiguration {
    properties: PropertySet,
    prefix: String,
}

impl AutoConfiguration {
    pub fn new(properties: PropertySet) -> Self {
        AutoConfiguration {
            properties,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Reads the properties under `prefix` instead of `rabbitmq`. An empty prefix binds
    /// top-level keys.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn resolve(&self, mut definitions: Definitions) -> Result<ComponentRegistry> {
        let bound = RabbitProperties::bind(&self.properties, &self.prefix)?;
        let listener_support = definitions.listener_support();
        debug!(?listener_support, dynamic = bound.dynamic, "Resolving RabbitMQ components");

        let mut registry = ComponentRegistry::new();
        for role in Role::RESOLUTION_ORDER {
            let explicit = definitions.take_role(role);

            if role == Role::Admin && !bound.dynamic {
                debug!(skipped = explicit.len(), "dynamic is off, no admin registered");
                continue;
            }

            if !explicit.is_empty() {
                for definition in explicit {
                    let name = definition.name().to_string();
                    let component = definition.build(&registry)?;
                    debug!(role = %role, name = %name, "Using declared component");
                    registry.insert(&name, component, Origin::Explicit)?;
                }
                continue;
            }

            if role.is_listener_infrastructure() && !listener_support.is_active() {
                continue;
            }

            if let Some(component) = default_component(role, &bound, &registry, &definitions)? {
                debug!(role = %role, name = role.conventional_name(), "Registering default");
                registry.insert(role.conventional_name(), component, Origin::Default)?;
            }
        }

        if let (Ok(processor), Ok(endpoints)) = (
            registry.listener_annotation_processor(),
            registry.listener_endpoint_registry(),
        ) {
            processor.register_all(&endpoints);
        }

        info!(components = registry.len(), "RabbitMQ auto-configuration complete");
        Ok(registry)
    }
}

fn default_component(
    role: Role,
    bound: &RabbitProperties,
    registry: &ComponentRegistry,
    definitions: &Definitions,
) -> Result<Option<Component>> {
    let component = match role {
        Role::ConnectionFactory => {
            let socket_factory = SocketFactory::from_spec(&bound.connection)?;
            Component::ConnectionFactory(Arc::new(CachingConnectionFactory::from_spec(
                bound.connection.clone(),
                socket_factory,
            )))
        }
        Role::MessageConverter => return Ok(None),
        Role::Template => {
            let mut template = RabbitTemplate::new(registry.connection_factory()?);
            if let Ok(converter) = registry.message_converter() {
                template = template.with_message_converter(converter);
            }
            Component::Template(Arc::new(template))
        }
        Role::MessagingTemplate => Component::MessagingTemplate(Arc::new(
            RabbitMessagingTemplate::new(registry.rabbit_template()?),
        )),
        Role::Admin => Component::Admin(Arc::new(RabbitAdmin::new(registry.connection_factory()?))),
        Role::ListenerContainerFactory => {
            Component::ListenerContainerFactory(Arc::new(SimpleListenerContainerFactory::from_spec(
                registry.connection_factory()?,
                &bound.listener,
            )))
        }
        Role::ListenerAnnotationProcessor => Component::ListenerAnnotationProcessor(Arc::new(
            ListenerEndpointProcessor::new(definitions.endpoints().to_vec()),
        )),
        Role::ListenerEndpointRegistry => {
            Component::ListenerEndpointRegistry(Arc::new(ListenerEndpointRegistry::new()))
        }
    };
    Ok(Some(component))
}
