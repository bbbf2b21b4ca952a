//! Subscription connection, broadcast listeners and per-call connections

use crate::error::{ClientError, Result};
use dashmap::DashMap;
use scp_session::{
    connect_tcp, decode_args, decode_error, decode_reply, encode_args, subscribe, Conductor,
    Connection, ConnectionConfig, ConnectionHandle, IoStream, SessionError, TlsClientConfig,
    PAYLOAD_END, PAYLOAD_START,
};
use scp_wire::{Mode, Parameters, Signal, CID, SID, STATUS, STATUS_ERROR};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Callback receiving the decoded arguments of a broadcast
pub type Listener = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

type Listeners = Arc<DashMap<String, Vec<Listener>>>;

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Identifier announced as `CID`
    pub identifier: String,
    /// Settings for every connection the client opens
    pub connection: ConnectionConfig,
    /// TLS settings; plain TCP when unset
    pub tls: Option<TlsClientConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identifier: format!("scp-client-{}", uuid::Uuid::new_v4()),
            connection: ConnectionConfig::default(),
            tls: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("identifier", &self.identifier)
            .field("connection", &self.connection)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

struct Subscription {
    addr: SocketAddr,
    server_identifier: Option<String>,
    handle: ConnectionHandle,
}

struct Inner {
    config: ClientConfig,
    listeners: Listeners,
    subscription: Mutex<Option<Subscription>>,
}

/// Cloneable client handle
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identifier", &self.inner.config.identifier)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Client {
    /// Create a client with default connection settings
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_config(ClientConfig {
            identifier: identifier.into(),
            ..Default::default()
        })
    }

    /// Create a client from a full configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                listeners: Arc::new(DashMap::new()),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Client identifier
    pub fn identifier(&self) -> &str {
        &self.inner.config.identifier
    }

    fn subscription(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.inner
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect and subscribe; resolves once the server acknowledged
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        Parameters::validate_entry(CID, &self.inner.config.identifier)?;
        let mut connection = self.dial(addr).await?;
        let ack = subscribe(&mut connection, &self.inner.config.identifier).await?;
        let handle = connection.handle();

        let previous = self.subscription().replace(Subscription {
            addr,
            server_identifier: ack.get(SID).map(str::to_string),
            handle,
        });
        if let Some(previous) = previous {
            debug!("Replacing subscription to {}", previous.addr);
            previous.handle.close();
        }

        tokio::spawn(broadcast_loop(
            connection,
            Arc::clone(&self.inner.listeners),
        ));
        info!("Client {} connected to {}", self.inner.config.identifier, addr);
        Ok(())
    }

    /// Resolve `host` and connect to the first address found
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<()> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}:{}", host, port),
                )
            })?;
        self.connect(addr).await
    }

    /// Whether the subscription connection is up
    pub fn is_connected(&self) -> bool {
        self.subscription()
            .as_ref()
            .map(|subscription| !subscription.handle.is_closed())
            .unwrap_or(false)
    }

    /// `SID` the server acknowledged the subscription with
    pub fn server_identifier(&self) -> Option<String> {
        self.subscription()
            .as_ref()
            .and_then(|subscription| subscription.server_identifier.clone())
    }

    /// Close the subscription connection
    pub fn disconnect(&self) {
        if let Some(subscription) = self.subscription().take() {
            info!("Client {} disconnecting from {}", self.inner.config.identifier, subscription.addr);
            subscription.handle.close();
        }
    }

    /// Add a listener for broadcasts of `operation`
    pub fn on<F>(&self, operation: impl Into<String>, listener: F) -> &Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .entry(operation.into())
            .or_default()
            .push(Arc::new(listener));
        self
    }

    /// Remove every listener of `operation`; returns whether any existed
    pub fn off(&self, operation: &str) -> bool {
        self.inner.listeners.remove(operation).is_some()
    }

    /// Call a REPLY operation and return its JSON result
    pub async fn message<A>(&self, operation: &str, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        let mut connection = self.call_connection().await?;
        let mut call = connection.open_outgoing()?;
        call.set_rfi(Mode::Reply, operation, self.call_parameters())?;
        call.write(encode_args(args)?).await?;
        call.end().await?;

        let mut reply = connection
            .accept()
            .await
            .ok_or(SessionError::ConnectionClosed)?;
        let body = reply.read_to_end().await?;
        debug!("{} answered with {} bytes", reply.rfi(), body.len());
        Ok(decode_reply(reply.rfi(), &body)?)
    }

    /// Typed form of [`Client::message`]
    pub async fn execute<A, R>(&self, operation: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.message(operation, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a CONDUCTOR operation and return the live conductor
    pub async fn conduct<A>(&self, operation: &str, args: &A) -> Result<Conductor>
    where
        A: Serialize + ?Sized,
    {
        let mut connection = self.call_connection().await?;
        let mut call = connection.open_outgoing()?;
        call.set_rfi(Mode::Conductor, operation, self.call_parameters())?;
        call.write_signal(&Signal::new(PAYLOAD_START)).await?;
        call.write(encode_args(args)?).await?;
        call.write_signal(&Signal::new(PAYLOAD_END)).await?;

        let mut reply = connection
            .accept()
            .await
            .ok_or(SessionError::ConnectionClosed)?;
        if reply.get(STATUS) == Some(STATUS_ERROR) {
            let body = reply.read_to_end().await?;
            return Err(ClientError::Remote(decode_error(&body)));
        }

        Ok(Conductor::new(reply, call).bind_connection(connection))
    }

    fn call_parameters(&self) -> Parameters {
        Parameters::new().with(CID, self.inner.config.identifier.as_str())
    }

    async fn call_connection(&self) -> Result<Connection> {
        let addr = {
            let subscription = self.subscription();
            match subscription.as_ref() {
                Some(subscription) if !subscription.handle.is_closed() => subscription.addr,
                _ => return Err(ClientError::NotConnected),
            }
        };
        self.dial(addr).await
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Connection> {
        let stream = connect_tcp(addr).await?;
        let config = self.inner.config.connection.clone();

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.inner.config.tls {
            let io = scp_session::tls::connect_tls(tls, stream)
                .await
                .map_err(ClientError::Tls)?;
            return Ok(Connection::from_io(io, config));
        }

        Ok(Connection::from_io(IoStream::Plain(stream), config))
    }
}

async fn broadcast_loop(mut connection: Connection, listeners: Listeners) {
    while let Some(mut incoming) = connection.accept().await {
        if incoming.mode() != Mode::Broadcast {
            warn!("Ignoring unexpected {} on subscription connection", incoming.rfi());
            if incoming.drain().await.is_err() {
                break;
            }
            continue;
        }

        let callbacks = listeners
            .get(incoming.operation())
            .map(|entry| entry.value().clone());
        let Some(callbacks) = callbacks else {
            debug!("No listener for broadcast {}", incoming.operation());
            if incoming.drain().await.is_err() {
                break;
            }
            continue;
        };

        let body = match incoming.read_to_end().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read broadcast {}: {}", incoming.operation(), e);
                break;
            }
        };
        match decode_args::<Vec<Value>>(&body) {
            Ok(args) => {
                for callback in &callbacks {
                    callback(args.clone());
                }
            }
            Err(e) => warn!("Malformed broadcast {}: {}", incoming.operation(), e),
        }
    }

    info!("Subscription connection closed");
}
