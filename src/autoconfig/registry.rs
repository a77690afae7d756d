use std::collections::HashMap;
use std::sync::Arc;

use super::component::{Component, Role};
use crate::errors::{AutoConfigError, Result};
use crate::rabbitmq::{
    AmqpAdmin, ConnectionFactory, ListenerContainerFactory, ListenerEndpointProcessor,
    ListenerEndpointRegistry, MessageConverter, RabbitMessagingTemplate, RabbitTemplate,
};

/// Who supplied a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Declared by the caller.
    Explicit,
    /// Built by the resolver from properties.
    Default,
}

#[derive(Debug)]
struct Entry {
    name: String,
    component: Component,
    origin: Origin,
}

/// Named singletons produced by one resolution pass.
///
/// Only the resolver inserts; once handed out the registry is read-only and can be
/// shared freely between threads.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

macro_rules! role_lookup {
    ($(#[$doc:meta])* $fn_name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $fn_name(&self) -> Result<$ty> {
            match self.find(Role::$variant) {
                Some(Component::$variant(component)) => Ok(component.clone()),
                _ => Err(AutoConfigError::NoSuchComponent(format!(
                    "role '{}'",
                    Role::$variant
                ))),
            }
        }
    };
}

impl ComponentRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `component` under `name`. An existing explicit entry is never replaced.
    pub(crate) fn insert(&mut self, name: &str, component: Component, origin: Origin) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(AutoConfigError::DuplicateComponent(name.to_string()));
        }
        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push(Entry {
            name: name.to_string(),
            component,
            origin,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Component> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i].component)
            .ok_or_else(|| AutoConfigError::NoSuchComponent(format!("name '{}'", name)))
    }

    pub fn origin(&self, name: &str) -> Option<Origin> {
        self.index.get(name).map(|&i| self.entries[i].origin)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Component, Origin)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.as_str(), &entry.component, entry.origin))
    }

    /// The first component registered for `role`.
    pub fn find(&self, role: Role) -> Option<&Component> {
        self.entries
            .iter()
            .map(|entry| &entry.component)
            .find(|component| component.role() == role)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.find(role).is_some()
    }

    role_lookup!(
        /// The primary connection factory.
        connection_factory,
        ConnectionFactory,
        Arc<dyn ConnectionFactory>
    );
    role_lookup!(message_converter, MessageConverter, Arc<dyn MessageConverter>);
    role_lookup!(rabbit_template, Template, Arc<RabbitTemplate>);
    role_lookup!(messaging_template, MessagingTemplate, Arc<RabbitMessagingTemplate>);
    role_lookup!(
        /// Fails with `NoSuchComponent` when `dynamic` is off.
        amqp_admin,
        Admin,
        Arc<dyn AmqpAdmin>
    );
    role_lookup!(
        listener_container_factory,
        ListenerContainerFactory,
        Arc<dyn ListenerContainerFactory>
    );
    role_lookup!(
        listener_annotation_processor,
        ListenerAnnotationProcessor,
        Arc<ListenerEndpointProcessor>
    );
    role_lookup!(
        listener_endpoint_registry,
        ListenerEndpointRegistry,
        Arc<ListenerEndpointRegistry>
    );
}
