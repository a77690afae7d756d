use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amq_protocol_types::ShortUInt;
use async_trait::async_trait;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::binder::ConnectionSpec;
use crate::errors::AmqpResult;
use crate::transport::SocketFactory;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Source of broker connections shared by templates, admins and listener containers.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn virtual_host(&self) -> &str;

    fn username(&self) -> &str;

    fn socket_factory(&self) -> &SocketFactory;

    fn requested_heartbeat(&self) -> ShortUInt;

    fn as_any(&self) -> &dyn Any;

    /// Returns an open connection, connecting first if needed.
    async fn create_connection(&self) -> AmqpResult<Arc<Connection>>;

    async fn close(&self) -> AmqpResult<()>;
}

/// Closes a channel that is still open. Failures are logged, not returned, so callers
/// can close on their error paths without masking the original error.
pub(crate) async fn close_channel(channel: &Channel, reason: &str) {
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel.close(200, reason).await {
        warn!("Failed to close channel {}: {}", channel.id(), e);
    }
}

/// Connection factory that keeps a single broker connection open and hands it out
/// to every caller, reconnecting with exponential backoff when it drops.
pub struct CachingConnectionFactory {
    spec: ConnectionSpec,
    socket_factory: SocketFactory,
    connection: Mutex<Option<Arc<Connection>>>,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl fmt::Debug for CachingConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingConnectionFactory")
            .field("host", &self.spec.host)
            .field("port", &self.spec.port)
            .field("virtual_host", &self.spec.virtual_host)
            .field("socket_factory", &self.socket_factory)
            .finish_non_exhaustive()
    }
}

impl CachingConnectionFactory {
    /// Plain connection factory for `host:port` with default credentials.
    pub fn new(host: &str, port: u16) -> Self {
        Self::from_spec(ConnectionSpec::new(host, port), SocketFactory::platform_default())
    }

    pub fn from_spec(spec: ConnectionSpec, socket_factory: SocketFactory) -> Self {
        CachingConnectionFactory {
            spec,
            socket_factory,
            connection: Mutex::new(None),
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// The broker address this factory connects to.
    pub fn amqp_uri(&self) -> AMQPUri {
        let heartbeat = match self.spec.requested_heartbeat {
            0 => None,
            seconds => Some(seconds),
        };
        AMQPUri {
            scheme: self.socket_factory.scheme(),
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.spec.username.clone(),
                    password: self.spec.password.clone(),
                },
                host: self.spec.host.clone(),
                port: self.spec.port,
            },
            vhost: self.spec.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat,
                ..AMQPQueryString::default()
            },
        }
    }

    async fn connect_once(&self) -> Result<Connection, LapinError> {
        let uri = self.amqp_uri();
        match &self.socket_factory {
            SocketFactory::Plain(_) => {
                Connection::connect_uri(uri, ConnectionProperties::default()).await
            }
            SocketFactory::Tls(tls) => {
                Connection::connect_uri_with_config(
                    uri,
                    ConnectionProperties::default(),
                    tls.tls_config(),
                )
                .await
            }
        }
    }

    async fn establish_connection(&self) -> Result<Connection, LapinError> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            info!(
                host = %self.spec.host,
                port = self.spec.port,
                virtual_host = %self.spec.virtual_host,
                "Attempting to connect to RabbitMQ"
            );

            match self.connect_once().await {
                Ok(conn) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {:?}",
                        attempts, self.max_reconnect_attempts, err
                    );

                    if attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    // Exponential backoff with +/-15% jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for CachingConnectionFactory {
    fn host(&self) -> &str {
        &self.spec.host
    }

    fn port(&self) -> u16 {
        self.spec.port
    }

    fn virtual_host(&self) -> &str {
        &self.spec.virtual_host
    }

    fn username(&self) -> &str {
        &self.spec.username
    }

    fn socket_factory(&self) -> &SocketFactory {
        &self.socket_factory
    }

    fn requested_heartbeat(&self) -> ShortUInt {
        self.spec.requested_heartbeat
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn create_connection(&self) -> AmqpResult<Arc<Connection>> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }

        let conn = Arc::new(self.establish_connection().await?);
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn close(&self) -> AmqpResult<()> {
        if let Some(conn) = self.connection.lock().await.take() {
            if conn.status().connected() {
                info!("Closing RabbitMQ connection gracefully");
                conn.close(200, "Closing connection factory").await?;
            }
        }
        Ok(())
    }
}
