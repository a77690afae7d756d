// Resolution behaviour seen from outside the crate: defaults, property overrides,
// back-off to caller definitions, conditional roles and the secure transport.

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use amq_protocol_types::ShortUInt;
use async_trait::async_trait;
use lapin::Connection;
use rstest::rstest;

use rabbit_autoconfig::rabbitmq::{
    AmqpAdmin, CachingConnectionFactory, ConnectionFactory, ContainerSettings,
    JsonMessageConverter, ListenerContainer, ListenerContainerFactory, ListenerEndpoint,
    MessageConverter, RabbitMessagingTemplate, RabbitTemplate, SimpleListenerContainerFactory,
};
use rabbit_autoconfig::{
    AcknowledgeMode, AmqpError, AmqpResult, AutoConfigError, AutoConfiguration, Component,
    ComponentRegistry, Definitions, Origin, PropertySet, Role, SocketFactory,
};

fn resolve(entries: &[&str], definitions: Definitions) -> rabbit_autoconfig::Result<ComponentRegistry> {
    let properties = PropertySet::from_entries(entries)?;
    AutoConfiguration::new(properties).resolve(definitions)
}

fn ssl_fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/ssl")
        .join(name)
        .display()
        .to_string()
}

/// Connection factory that never reaches a broker.
#[derive(Debug)]
struct OfflineConnectionFactory {
    socket_factory: SocketFactory,
}

impl OfflineConnectionFactory {
    fn new() -> Self {
        OfflineConnectionFactory {
            socket_factory: SocketFactory::platform_default(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for OfflineConnectionFactory {
    fn host(&self) -> &str {
        "offline"
    }

    fn port(&self) -> u16 {
        0
    }

    fn virtual_host(&self) -> &str {
        "/"
    }

    fn username(&self) -> &str {
        "nobody"
    }

    fn socket_factory(&self) -> &SocketFactory {
        &self.socket_factory
    }

    fn requested_heartbeat(&self) -> ShortUInt {
        0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn create_connection(&self) -> AmqpResult<Arc<Connection>> {
        Err(AmqpError::ConnectionError("offline".to_string()))
    }

    async fn close(&self) -> AmqpResult<()> {
        Ok(())
    }
}

/// Counts the containers it was asked for.
#[derive(Debug, Default)]
struct RecordingListenerFactory {
    created: AtomicUsize,
}

impl ListenerContainerFactory for RecordingListenerFactory {
    fn create_listener_container(&self, endpoint: &ListenerEndpoint) -> ListenerContainer {
        self.created.fetch_add(1, Ordering::SeqCst);
        ListenerContainer::new(
            endpoint.clone(),
            Arc::new(OfflineConnectionFactory::new()),
            ContainerSettings {
                auto_startup: false,
                acknowledge_mode: AcknowledgeMode::Manual,
                concurrent_consumers: 1,
                max_concurrent_consumers: None,
                prefetch_count: None,
                tx_size: 1,
            },
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Admin that records nothing and never touches a broker.
#[derive(Debug)]
struct NoopAdmin;

#[async_trait]
impl AmqpAdmin for NoopAdmin {
    async fn declare_exchange(&self, _name: &str, _kind: lapin::ExchangeKind) -> AmqpResult<()> {
        Ok(())
    }

    async fn delete_exchange(&self, _name: &str) -> AmqpResult<()> {
        Ok(())
    }

    async fn declare_queue(&self, _name: &str) -> AmqpResult<u32> {
        Ok(0)
    }

    async fn delete_queue(&self, _name: &str) -> AmqpResult<u32> {
        Ok(0)
    }

    async fn bind_queue(&self, _queue: &str, _exchange: &str, _routing_key: &str) -> AmqpResult<()> {
        Ok(())
    }
}

fn caching(factory: &Arc<dyn ConnectionFactory>) -> &CachingConnectionFactory {
    factory
        .as_any()
        .downcast_ref::<CachingConnectionFactory>()
        .expect("default connection factory is a CachingConnectionFactory")
}

#[test]
fn default_configuration() {
    let registry = resolve(&[], Definitions::new()).unwrap();

    let factory = registry.connection_factory().unwrap();
    let template = registry.rabbit_template().unwrap();
    let messaging = registry.messaging_template().unwrap();
    assert!(registry.amqp_admin().is_ok());

    assert_eq!(factory.host(), "localhost");
    assert_eq!(factory.port(), 5672);
    assert_eq!(factory.virtual_host(), "/");
    assert!(Arc::ptr_eq(template.connection_factory(), &factory));
    assert!(Arc::ptr_eq(messaging.rabbit_template(), &template));
    assert_eq!(registry.origin("rabbit_connection_factory"), Some(Origin::Default));
}

#[test]
fn connection_factory_with_overrides() {
    let registry = resolve(
        &[
            "rabbitmq.host:remote-server",
            "rabbitmq.port:9000",
            "rabbitmq.username:alice",
            "rabbitmq.password:secret",
            "rabbitmq.virtual_host:/vhost",
        ],
        Definitions::new(),
    )
    .unwrap();

    let factory = registry.connection_factory().unwrap();
    assert_eq!(factory.host(), "remote-server");
    assert_eq!(factory.port(), 9000);
    assert_eq!(factory.username(), "alice");
    assert_eq!(factory.virtual_host(), "/vhost");
    assert_eq!(caching(&factory).spec().password, "secret");
}

#[rstest]
#[case("rabbitmq.virtual_host:", "/")]
#[case("rabbitmq.virtual_host:/", "/")]
#[case("rabbitmq.virtual_host:foo", "foo")]
#[case("rabbitmq.virtual_host:///foo", "///foo")]
#[case("rabbitmq.virtualHost:/vhost", "/vhost")]
fn virtual_host_normalization(#[case] entry: &str, #[case] expected: &str) {
    let registry = resolve(&[entry], Definitions::new()).unwrap();
    assert_eq!(registry.connection_factory().unwrap().virtual_host(), expected);
}

#[test]
fn connection_factory_backs_off() {
    let definitions = Definitions::new().component(
        "a_different_connection_factory",
        Component::ConnectionFactory(Arc::new(CachingConnectionFactory::new("otherserver", 8001))),
    );
    let registry = resolve(&[], definitions).unwrap();

    assert!(!registry.contains("rabbit_connection_factory"));
    let factory = registry.connection_factory().unwrap();
    assert_eq!(factory.host(), "otherserver");
    assert_eq!(factory.port(), 8001);

    let template = registry.rabbit_template().unwrap();
    assert!(Arc::ptr_eq(template.connection_factory(), &factory));
    assert_eq!(
        registry.origin("a_different_connection_factory"),
        Some(Origin::Explicit)
    );
}

#[test]
fn template_backs_off_and_keeps_its_converter() {
    let converter: Arc<dyn MessageConverter> = Arc::new(JsonMessageConverter);
    let template_converter = converter.clone();
    let definitions = Definitions::new().define("my_template", Role::Template, move |registry| {
        let template =
            RabbitTemplate::new(registry.connection_factory()?).with_message_converter(template_converter);
        Ok(Component::Template(Arc::new(template)))
    });
    let registry = resolve(&[], definitions).unwrap();

    assert!(!registry.contains("rabbit_template"));
    let template = registry.rabbit_template().unwrap();
    assert!(Arc::ptr_eq(template.message_converter(), &converter));
}

#[test]
fn messaging_template_backs_off() {
    let definitions = Definitions::new().define(
        "my_messaging_template",
        Role::MessagingTemplate,
        |registry| {
            let messaging = RabbitMessagingTemplate::new(registry.rabbit_template()?)
                .with_default_destination("fooBar");
            Ok(Component::MessagingTemplate(Arc::new(messaging)))
        },
    );
    let registry = resolve(&[], definitions).unwrap();

    assert!(!registry.contains("rabbit_messaging_template"));
    let messaging = registry.messaging_template().unwrap();
    assert_eq!(messaging.default_destination(), Some("fooBar"));
}

#[test]
fn admin_backs_off() {
    let definitions =
        Definitions::new().component("my_admin", Component::Admin(Arc::new(NoopAdmin)));
    let registry = resolve(&[], definitions).unwrap();
    assert!(!registry.contains("amqp_admin"));
    assert!(registry.amqp_admin().is_ok());
}

#[test]
fn static_configuration_has_no_admin() {
    let registry = resolve(&["rabbitmq.dynamic:false"], Definitions::new()).unwrap();
    let err = registry.amqp_admin().unwrap_err();
    assert!(matches!(err, AutoConfigError::NoSuchComponent(_)));
    assert!(registry.rabbit_template().is_ok());
}

#[test]
fn listener_infrastructure_is_created_by_default() {
    let registry = resolve(&[], Definitions::new()).unwrap();
    let factory = registry.listener_container_factory().unwrap();
    assert!(factory
        .as_any()
        .downcast_ref::<SimpleListenerContainerFactory>()
        .is_some());
    assert!(registry.listener_annotation_processor().is_ok());
    assert!(registry.listener_endpoint_registry().is_ok());
    assert!(registry
        .listener_endpoint_registry()
        .unwrap()
        .endpoints()
        .is_empty());
}

#[test]
fn disabled_listeners_register_no_listener_infrastructure() {
    let registry = resolve(&[], Definitions::new().disable_listeners()).unwrap();
    for role in [
        Role::ListenerContainerFactory,
        Role::ListenerAnnotationProcessor,
        Role::ListenerEndpointRegistry,
    ] {
        assert!(!registry.has_role(role), "unexpected {}", role);
    }
}

#[test]
fn enabled_listeners_get_the_default_container_factory() {
    let registry = resolve(&[], Definitions::new().enable_listeners()).unwrap();
    let factory = registry.listener_container_factory().unwrap();
    let simple = factory
        .as_any()
        .downcast_ref::<SimpleListenerContainerFactory>()
        .expect("default listener factory");
    assert!(Arc::ptr_eq(
        simple.connection_factory(),
        &registry.connection_factory().unwrap()
    ));
    assert!(registry.listener_annotation_processor().is_ok());
    assert!(registry.listener_endpoint_registry().is_ok());
}

#[test]
fn listener_container_factory_backs_off() {
    let recording = Arc::new(RecordingListenerFactory::default());
    let definitions = Definitions::new()
        .enable_listeners()
        .component(
            "my_listener_factory",
            Component::ListenerContainerFactory(recording.clone()),
        );
    let registry = resolve(&[], definitions).unwrap();

    assert!(!registry.contains("rabbit_listener_container_factory"));
    let factory = registry.listener_container_factory().unwrap();
    let container = factory.create_listener_container(&ListenerEndpoint::new(["orders"]));
    assert_eq!(container.settings().acknowledge_mode, AcknowledgeMode::Manual);
    assert_eq!(recording.created.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_container_factory_with_custom_settings() {
    let registry = resolve(
        &[
            "rabbitmq.listener.autoStartup:false",
            "rabbitmq.listener.acknowledgeMode:manual",
            "rabbitmq.listener.concurrency:5",
            "rabbitmq.listener.maxConcurrency:10",
            "rabbitmq.listener.prefetch:40",
            "rabbitmq.listener.transactionSize:20",
        ],
        Definitions::new().enable_listeners(),
    )
    .unwrap();

    let factory = registry.listener_container_factory().unwrap();
    let simple = factory
        .as_any()
        .downcast_ref::<SimpleListenerContainerFactory>()
        .unwrap();
    assert!(!simple.auto_startup());
    assert_eq!(simple.acknowledge_mode(), AcknowledgeMode::Manual);
    assert_eq!(simple.concurrent_consumers(), Some(5));
    assert_eq!(simple.max_concurrent_consumers(), Some(10));
    assert_eq!(simple.prefetch_count(), Some(40));
    assert_eq!(simple.tx_size(), Some(20));
}

#[test]
fn declared_endpoints_enable_listeners_automatically() {
    let definitions = Definitions::new()
        .listener_endpoint(ListenerEndpoint::new(["orders"]).with_id("orders-listener"));
    let registry = resolve(&[], definitions).unwrap();

    assert!(registry.listener_container_factory().is_ok());
    let processor = registry.listener_annotation_processor().unwrap();
    assert_eq!(processor.endpoints().len(), 1);
    let endpoints = registry.listener_endpoint_registry().unwrap().endpoints();
    assert_eq!(endpoints[0].id, "orders-listener");
    assert_eq!(endpoints[0].queues, vec!["orders".to_string()]);
}

#[test]
fn requested_heartbeat_is_bound() {
    let registry = resolve(&["rabbitmq.requestedHeartbeat:20"], Definitions::new()).unwrap();
    assert_eq!(registry.connection_factory().unwrap().requested_heartbeat(), 20);
}

#[test]
fn no_ssl_uses_the_platform_default_socket_factory() {
    let registry = resolve(&[], Definitions::new()).unwrap();
    let factory = registry.connection_factory().unwrap();
    assert!(factory.socket_factory().is_platform_default());
    assert!(!factory.socket_factory().is_secure());
}

#[test]
fn ssl_without_stores_uses_a_secure_socket_factory() {
    let registry = resolve(&["rabbitmq.ssl.enabled:true"], Definitions::new()).unwrap();
    let socket_factory = registry.connection_factory().unwrap().socket_factory().clone();
    assert!(socket_factory.is_secure());
    assert!(!socket_factory.is_platform_default());
}

#[test]
fn ssl_with_stores_loads_both() {
    let key_store = format!("rabbitmq.ssl.keyStore={}", ssl_fixture("keystore.p12"));
    let trust_store = format!("rabbitmq.ssl.trustStore={}", ssl_fixture("truststore.pem"));
    let registry = resolve(
        &[
            "rabbitmq.ssl.enabled:true",
            &key_store,
            "rabbitmq.ssl.keyStorePassword=secret",
            &trust_store,
            "rabbitmq.ssl.trustStorePassword=secret",
        ],
        Definitions::new(),
    )
    .unwrap();

    let socket_factory = registry.connection_factory().unwrap().socket_factory().clone();
    let tls = socket_factory.tls().expect("TLS socket factory");
    assert_eq!(tls.trusted_certificates(), 1);
    assert!(tls.identity().is_some());
    let config = tls.tls_config();
    assert!(config.cert_chain.is_some());
    assert_eq!(config.identity.map(|identity| identity.password), Some("secret".to_string()));
}

#[test]
fn ssl_with_a_missing_key_store_fails() {
    let err = resolve(
        &["rabbitmq.ssl.enabled:true", "rabbitmq.ssl.keyStore=foo"],
        Definitions::new(),
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("foo"), "{}", message);
    assert!(message.contains("does not exist"), "{}", message);
}

#[test]
fn ssl_with_a_missing_trust_store_fails() {
    let err = resolve(
        &["rabbitmq.ssl.enabled:true", "rabbitmq.ssl.trustStore=missing-trust.pem"],
        Definitions::new(),
    )
    .unwrap_err();
    assert!(matches!(err, AutoConfigError::TransportInitialization { .. }));
    assert!(err.to_string().contains("missing-trust.pem"));
}

#[test]
fn ssl_with_the_wrong_key_store_password_fails_at_startup() {
    let key_store = format!("rabbitmq.ssl.keyStore={}", ssl_fixture("keystore.p12"));
    let err = resolve(
        &[
            "rabbitmq.ssl.enabled:true",
            &key_store,
            "rabbitmq.ssl.keyStorePassword=wrong",
        ],
        Definitions::new(),
    )
    .unwrap_err();
    assert!(matches!(err, AutoConfigError::TransportInitialization { .. }));
    assert!(err.to_string().contains("keystore.p12"), "{}", err);
}

#[test]
fn ssl_with_a_corrupt_key_store_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ks.p12");
    std::fs::write(&path, b"this is not pkcs12").unwrap();
    let key_store = format!("rabbitmq.ssl.keyStore={}", path.display());
    let err = resolve(
        &[
            "rabbitmq.ssl.enabled:true",
            &key_store,
            "rabbitmq.ssl.keyStorePassword=wrong",
        ],
        Definitions::new(),
    )
    .unwrap_err();
    assert!(matches!(err, AutoConfigError::TransportInitialization { .. }));
    assert!(err.to_string().contains("ks.p12"), "{}", err);
}

#[rstest]
#[case("rabbitmq.port:abc", "rabbitmq.port")]
#[case("rabbitmq.requestedHeartbeat:soon", "rabbitmq.requestedHeartbeat")]
#[case("rabbitmq.listener.acknowledgeMode:sometimes", "rabbitmq.listener.acknowledgeMode")]
#[case("rabbitmq.dynamic:maybe", "rabbitmq.dynamic")]
fn invalid_values_name_the_key(#[case] entry: &str, #[case] key: &str) {
    let err = resolve(&[entry], Definitions::new()).unwrap_err();
    assert!(matches!(err, AutoConfigError::InvalidConfiguration { .. }));
    assert!(err.to_string().contains(key), "{}", err);
}

#[test]
fn registry_can_be_shared_between_threads() {
    let registry = Arc::new(resolve(&[], Definitions::new()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            std::thread::spawn(move || registry.connection_factory().unwrap().host().to_string())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), "localhost");
    }
}
