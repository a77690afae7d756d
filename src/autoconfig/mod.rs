// src/autoconfig/mod.rs
// Decides, role by role, between caller-declared components and defaults built from properties

pub mod component;
pub mod definitions;
pub mod registry;
pub mod resolver;

pub use component::{Component, Role};
pub use definitions::{Definition, Definitions, ListenerSupport};
pub use registry::{ComponentRegistry, Origin};
pub use resolver::AutoConfiguration;
