use std::fmt;

use super::component::{Component, Role};
use super::registry::ComponentRegistry;
use crate::errors::{AutoConfigError, Result};
use crate::rabbitmq::ListenerEndpoint;

type Constructor = Box<dyn FnOnce(&ComponentRegistry) -> Result<Component>>;

/// A component declared by the caller, built lazily once its dependencies exist.
pub struct Definition {
    name: String,
    role: Role,
    constructor: Constructor,
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Definition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Runs the constructor against the registry built so far.
    pub(crate) fn build(self, registry: &ComponentRegistry) -> Result<Component> {
        let component = (self.constructor)(registry)?;
        if component.role() != self.role {
            return Err(AutoConfigError::DefinitionMismatch {
                name: self.name,
                expected: self.role.to_string(),
                actual: component.role().to_string(),
            });
        }
        Ok(component)
    }
}

/// Why listener infrastructure is (or is not) being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerSupport {
    /// Requested with [`Definitions::enable_listeners`].
    Explicit,
    /// Listener endpoints were declared without an explicit request.
    Detected,
    /// Nothing was said either way; listener infrastructure is available by default.
    Automatic,
    /// Turned off with [`Definitions::disable_listeners`].
    Disabled,
}

impl ListenerSupport {
    pub fn is_active(self) -> bool {
        !matches!(self, ListenerSupport::Disabled)
    }
}

/// Everything the caller declares up front: explicit components, listener endpoints
/// and whether listener support is requested.
#[derive(Debug, Default)]
pub struct Definitions {
    definitions: Vec<Definition>,
    endpoints: Vec<ListenerEndpoint>,
    listeners: Option<bool>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an already constructed component; its role follows from its variant.
    pub fn component(self, name: &str, component: Component) -> Self {
        let role = component.role();
        self.define(name, role, move |_| Ok(component))
    }

    /// Declares a component for `role` built from the registry resolved so far, so it
    /// can depend on the roles that come before it in [`Role::RESOLUTION_ORDER`].
    pub fn define<F>(mut self, name: &str, role: Role, constructor: F) -> Self
    where
        F: FnOnce(&ComponentRegistry) -> Result<Component> + 'static,
    {
        self.definitions.push(Definition {
            name: name.to_string(),
            role,
            constructor: Box::new(constructor),
        });
        self
    }

    pub fn listener_endpoint(mut self, endpoint: ListenerEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn enable_listeners(mut self) -> Self {
        self.listeners = Some(true);
        self
    }

    /// Skips the default listener infrastructure. Explicit listener definitions are
    /// still registered.
    pub fn disable_listeners(mut self) -> Self {
        self.listeners = Some(false);
        self
    }

    pub fn declares(&self, role: Role) -> bool {
        self.definitions.iter().any(|definition| definition.role == role)
    }

    pub fn endpoints(&self) -> &[ListenerEndpoint] {
        &self.endpoints
    }

    pub fn listener_support(&self) -> ListenerSupport {
        match self.listeners {
            Some(true) => ListenerSupport::Explicit,
            Some(false) => ListenerSupport::Disabled,
            None if !self.endpoints.is_empty() => ListenerSupport::Detected,
            None => ListenerSupport::Automatic,
        }
    }

    /// Removes and returns the definitions declared for `role`, in declaration order.
    pub(crate) fn take_role(&mut self, role: Role) -> Vec<Definition> {
        let (taken, kept) = std::mem::take(&mut self.definitions)
            .into_iter()
            .partition(|definition| definition.role == role);
        self.definitions = kept;
        taken
    }
}
