//! Auto-configuration for a RabbitMQ client layer.
//!
//! Properties are bound into connection and listener settings, then
//! [`AutoConfiguration::resolve`] builds a [`ComponentRegistry`] holding the
//! connection factory, templates, admin and listener infrastructure. Any role the
//! caller declares in [`Definitions`] replaces the default for that role.
//!
//! ```no_run
//! use rabbit_autoconfig::rabbitmq::ConnectionFactory;
//! use rabbit_autoconfig::{AutoConfiguration, Definitions, PropertySet};
//!
//! let properties = PropertySet::new()
//!     .with("rabbitmq.host", "broker.internal")
//!     .with("rabbitmq.virtual_host", "orders");
//! let registry = AutoConfiguration::new(properties)
//!     .resolve(Definitions::new())
//!     .unwrap();
//! assert_eq!(registry.connection_factory().unwrap().host(), "broker.internal");
//! ```

pub mod autoconfig;
pub mod binder;
pub mod config;
pub mod errors;
pub mod rabbitmq;
pub mod transport;

pub use autoconfig::{
    AutoConfiguration, Component, ComponentRegistry, Definitions, ListenerSupport, Origin, Role,
};
pub use binder::{AcknowledgeMode, ConnectionSpec, ListenerSpec, RabbitProperties};
pub use config::{load_properties, PropertySet};
pub use errors::{AmqpError, AmqpResult, AutoConfigError, Result};
pub use transport::SocketFactory;
