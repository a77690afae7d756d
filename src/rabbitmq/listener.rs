use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use amq_protocol_types::ShortUInt;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionFactory;
use super::template::Message;
use crate::binder::{AcknowledgeMode, ListenerSpec};
use crate::errors::{AmqpError, AmqpResult};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How long a consumer waits for a delivery before flushing pending acknowledgements.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked for every delivery. The acker is only handed over in
/// [`AcknowledgeMode::Manual`]; in the other modes the container settles deliveries.
pub type ListenerHandler = Arc<dyn Fn(Message, Option<Acker>) -> Result<(), String> + Send + Sync>;

/// A consumer declared by the application: an id and the queues it listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEndpoint {
    pub id: String,
    pub queues: Vec<String>,
}

impl ListenerEndpoint {
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ListenerEndpoint {
            id: format!("endpoint-{}", &Uuid::new_v4().simple().to_string()[..8]),
            queues: queues.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// Effective settings of one listener container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub auto_startup: bool,
    pub acknowledge_mode: AcknowledgeMode,
    pub concurrent_consumers: u32,
    pub max_concurrent_consumers: Option<u32>,
    pub prefetch_count: Option<ShortUInt>,
    /// Deliveries acknowledged together in [`AcknowledgeMode::Auto`].
    pub tx_size: u32,
}

/// Creates listener containers for endpoints.
pub trait ListenerContainerFactory: Send + Sync + fmt::Debug {
    fn create_listener_container(&self, endpoint: &ListenerEndpoint) -> ListenerContainer;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
pub struct SimpleListenerContainerFactory {
    connection_factory: Arc<dyn ConnectionFactory>,
    auto_startup: bool,
    acknowledge_mode: AcknowledgeMode,
    concurrent_consumers: Option<u32>,
    max_concurrent_consumers: Option<u32>,
    prefetch_count: Option<ShortUInt>,
    tx_size: Option<u32>,
}

impl SimpleListenerContainerFactory {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::from_spec(connection_factory, &ListenerSpec::default())
    }

    pub fn from_spec(connection_factory: Arc<dyn ConnectionFactory>, spec: &ListenerSpec) -> Self {
        SimpleListenerContainerFactory {
            connection_factory,
            auto_startup: spec.auto_startup,
            acknowledge_mode: spec.acknowledge_mode,
            concurrent_consumers: spec.concurrency,
            max_concurrent_consumers: spec.max_concurrency,
            prefetch_count: spec.prefetch,
            tx_size: spec.transaction_size,
        }
    }

    pub fn connection_factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connection_factory
    }

    pub fn auto_startup(&self) -> bool {
        self.auto_startup
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.acknowledge_mode
    }

    pub fn concurrent_consumers(&self) -> Option<u32> {
        self.concurrent_consumers
    }

    pub fn max_concurrent_consumers(&self) -> Option<u32> {
        self.max_concurrent_consumers
    }

    pub fn prefetch_count(&self) -> Option<ShortUInt> {
        self.prefetch_count
    }

    pub fn tx_size(&self) -> Option<u32> {
        self.tx_size
    }
}

impl ListenerContainerFactory for SimpleListenerContainerFactory {
    fn create_listener_container(&self, endpoint: &ListenerEndpoint) -> ListenerContainer {
        let settings = ContainerSettings {
            auto_startup: self.auto_startup,
            acknowledge_mode: self.acknowledge_mode,
            concurrent_consumers: self.concurrent_consumers.unwrap_or(1).max(1),
            max_concurrent_consumers: self.max_concurrent_consumers,
            prefetch_count: self.prefetch_count,
            tx_size: self.tx_size.unwrap_or(1).max(1),
        };
        debug!(endpoint = %endpoint.id, ?settings, "Creating listener container");
        ListenerContainer::new(endpoint.clone(), self.connection_factory.clone(), settings)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Consumers for one endpoint. Starts `concurrent_consumers` consumer tasks per queue.
pub struct ListenerContainer {
    endpoint: ListenerEndpoint,
    connection_factory: Arc<dyn ConnectionFactory>,
    settings: ContainerSettings,
    consumers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for ListenerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContainer")
            .field("endpoint", &self.endpoint)
            .field("settings", &self.settings)
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

impl ListenerContainer {
    pub fn new(
        endpoint: ListenerEndpoint,
        connection_factory: Arc<dyn ConnectionFactory>,
        settings: ContainerSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        ListenerContainer {
            endpoint,
            connection_factory,
            settings,
            consumers: Vec::new(),
            shutdown,
        }
    }

    pub fn endpoint(&self) -> &ListenerEndpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.consumers.iter().any(|consumer| !consumer.is_finished())
    }

    pub async fn start(&mut self, handler: ListenerHandler) -> AmqpResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        let connection = self.connection_factory.create_connection().await?;

        for queue in &self.endpoint.queues {
            for _ in 0..self.settings.concurrent_consumers {
                let channel = connection
                    .create_channel()
                    .await
                    .map_err(|e| AmqpError::ChannelError(e.to_string()))?;
                if let Some(prefetch) = self.settings.prefetch_count {
                    channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
                }

                let consumer_tag =
                    format!("{}-{}", self.endpoint.id, &Uuid::new_v4().simple().to_string()[..8]);
                let consumer = channel
                    .basic_consume(
                        queue,
                        &consumer_tag,
                        BasicConsumeOptions {
                            no_ack: self.settings.acknowledge_mode == AcknowledgeMode::None,
                            ..BasicConsumeOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| AmqpError::ConsumeError(e.to_string()))?;

                info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");
                self.consumers.push(tokio::spawn(consume(
                    consumer,
                    self.settings.clone(),
                    handler.clone(),
                    self.shutdown.subscribe(),
                )));
            }
        }
        Ok(())
    }

    /// Signals every consumer to stop and waits for them, so pending acknowledgements
    /// are flushed before this returns.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for consumer in self.consumers.drain(..) {
            if let Err(e) = consumer.await {
                warn!("Consumer task ended abnormally: {}", e);
            }
        }
        info!(endpoint = %self.endpoint.id, "Listener container stopped");
    }
}

/// Groups successful deliveries in [`AcknowledgeMode::Auto`] so one `multiple` ack
/// settles a whole batch. `T` is whatever acknowledges the latest delivery.
///
/// The batch never exceeds the prefetch count, otherwise the broker would stop
/// delivering before it fills.
#[derive(Debug)]
struct AckBatch<T> {
    size: u32,
    pending: u32,
    latest: Option<T>,
}

impl<T> AckBatch<T> {
    fn new(tx_size: u32, prefetch: Option<ShortUInt>) -> Self {
        let size = match prefetch {
            Some(prefetch) if prefetch > 0 => tx_size.min(u32::from(prefetch)),
            _ => tx_size,
        };
        AckBatch {
            size: size.max(1),
            pending: 0,
            latest: None,
        }
    }

    /// Records a handled delivery. Returns its acker once the batch is full.
    fn record(&mut self, acker: T) -> Option<T> {
        self.pending += 1;
        if self.pending >= self.size {
            self.pending = 0;
            self.latest = None;
            Some(acker)
        } else {
            self.latest = Some(acker);
            None
        }
    }

    /// The acker covering every pending delivery, if there are any.
    fn flush(&mut self) -> Option<T> {
        self.pending = 0;
        self.latest.take()
    }
}

async fn ack_multiple(acker: Acker) {
    if let Err(e) = acker.ack(BasicAckOptions { multiple: true }).await {
        error!("Failed to acknowledge messages: {}", e);
    }
}

async fn consume(
    mut consumer: lapin::Consumer,
    settings: ContainerSettings,
    handler: ListenerHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch = AckBatch::new(settings.tx_size, settings.prefetch_count);

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = timeout(RECEIVE_TIMEOUT, consumer.next()) => next,
        };
        let delivery = match next {
            Err(_) => {
                if let Some(acker) = batch.flush() {
                    debug!("Acknowledging pending deliveries after idle receive");
                    ack_multiple(acker).await;
                }
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                error!("Error receiving message: {}", e);
                break;
            }
            Ok(Some(Ok(delivery))) => delivery,
        };

        let message = Message {
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            body: delivery.data,
        };
        let acker = delivery.acker;

        match settings.acknowledge_mode {
            AcknowledgeMode::None => {
                if let Err(e) = handler(message, None) {
                    warn!("Listener failed on an unacknowledged delivery: {}", e);
                }
            }
            AcknowledgeMode::Manual => {
                if let Err(e) = handler(message, Some(acker)) {
                    warn!("Listener failed: {}", e);
                }
            }
            AcknowledgeMode::Auto => match handler(message, None) {
                Ok(()) => {
                    if let Some(acker) = batch.record(acker) {
                        ack_multiple(acker).await;
                    }
                }
                Err(e) => {
                    error!("Error processing message: {}", e);
                    if let Err(e) = acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                    {
                        error!("Failed to negatively acknowledge message: {}", e);
                    }
                }
            },
        }
    }

    if let Some(acker) = batch.flush() {
        ack_multiple(acker).await;
    }
}

/// Holds the declared endpoints and the containers created for them.
#[derive(Debug, Default)]
pub struct ListenerEndpointRegistry {
    endpoints: RwLock<Vec<ListenerEndpoint>>,
    containers: Mutex<Vec<ListenerContainer>>,
}

impl ListenerEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_endpoint(&self, endpoint: ListenerEndpoint) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        if endpoints.iter().any(|existing| existing.id == endpoint.id) {
            warn!(endpoint = %endpoint.id, "Endpoint already registered");
            return;
        }
        endpoints.push(endpoint);
    }

    pub fn endpoints(&self) -> Vec<ListenerEndpoint> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Creates a container per endpoint and starts those marked for auto startup.
    ///
    /// Returns how many containers were started.
    pub async fn start_all(
        &self,
        factory: &dyn ListenerContainerFactory,
        handler: ListenerHandler,
    ) -> AmqpResult<usize> {
        let mut containers = self.containers.lock().await;
        let mut started = 0;
        for endpoint in self.endpoints() {
            let mut container = factory.create_listener_container(&endpoint);
            if container.settings().auto_startup {
                container.start(handler.clone()).await?;
                started += 1;
            }
            containers.push(container);
        }
        Ok(started)
    }

    pub async fn stop_all(&self) {
        for container in self.containers.lock().await.iter_mut() {
            container.stop().await;
        }
    }
}

/// Feeds endpoints declared by the application into the endpoint registry.
#[derive(Debug, Default)]
pub struct ListenerEndpointProcessor {
    endpoints: Vec<ListenerEndpoint>,
}

impl ListenerEndpointProcessor {
    pub fn new(endpoints: Vec<ListenerEndpoint>) -> Self {
        ListenerEndpointProcessor { endpoints }
    }

    pub fn endpoints(&self) -> &[ListenerEndpoint] {
        &self.endpoints
    }

    pub fn register_all(&self, registry: &ListenerEndpointRegistry) {
        for endpoint in &self.endpoints {
            registry.register_endpoint(endpoint.clone());
        }
    }
}
