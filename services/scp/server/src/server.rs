//! Listener and per-connection serve loop

use crate::error::Result;
use dashmap::DashMap;
use scp_routing::{DispatchOutcome, Dispatcher, Executor, Handler};
use scp_session::{
    accept_subscription, listen_tcp, Conductor, Connection, ConnectionConfig, ConnectionHandle,
    IoStream, RemoteError,
};
use scp_wire::{Mode, Parameters, SID};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier stamped as `SID` on every server-originated RFI
    pub identifier: String,
    /// Settings applied to every accepted connection
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identifier: format!("scp-server-{}", uuid::Uuid::new_v4()),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Server under construction: registrations happen here, then it is bound
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    executor: Executor,
}

impl Default for Server {
    fn default() -> Self {
        Self::with_config(ServerConfig::default())
    }
}

impl Server {
    /// Create a server with default connection settings
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_config(ServerConfig {
            identifier: identifier.into(),
            ..Default::default()
        })
    }

    /// Create a server from a full configuration
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            executor: Executor::new(),
        }
    }

    /// Server identifier
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    /// Registration table
    pub fn executor(&mut self) -> &mut Executor {
        &mut self.executor
    }

    /// Register a JSON request/response function
    pub fn reply<A, R, E, F, Fut>(&mut self, operation: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.executor.reply(operation, f);
        self
    }

    /// Register a conductor function
    pub fn conductor<A, E, F, Fut>(&mut self, operation: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: Fn(A, Conductor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        self.executor.conductor(operation, f);
        self
    }

    /// Register a raw handler for every mode
    pub fn omni<H: Handler + 'static>(&mut self, operation: &str, handler: H) -> &mut Self {
        self.executor.omni(operation, handler);
        self
    }

    /// Mount an executor under a segment prefix
    pub fn attach(&mut self, prefix: &str, executor: Executor) -> &mut Self {
        self.executor.attach(prefix, executor);
        self
    }

    /// Bind a TCP listener and start serving
    pub async fn bind(self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = listen_tcp(addr).await?;
        self.serve(listener)
    }

    /// Serve plain TCP connections from `listener`
    pub fn serve(self, listener: TcpListener) -> Result<ServerHandle> {
        self.start(listener, Acceptor::Plain)
    }

    /// Serve TLS connections from `listener`
    #[cfg(feature = "tls")]
    pub fn serve_tls(
        self,
        listener: TcpListener,
        acceptor: scp_session::tls::TlsServer,
    ) -> Result<ServerHandle> {
        self.start(listener, Acceptor::Tls(acceptor))
    }

    fn start(self, listener: TcpListener, acceptor: Acceptor) -> Result<ServerHandle> {
        Parameters::validate_entry(SID, &self.config.identifier)?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ServerState {
            identifier: self.config.identifier,
            local_addr,
            connection: self.config.connection,
            registry: DashMap::new(),
            shutdown,
        });
        let dispatcher = Dispatcher::new(self.executor);

        info!("SCP server {} listening on {}", state.identifier, local_addr);
        tokio::spawn(accept_loop(
            listener,
            acceptor,
            dispatcher,
            Arc::clone(&state),
        ));

        Ok(ServerHandle { state })
    }
}

pub(crate) struct ServerState {
    pub(crate) identifier: String,
    local_addr: SocketAddr,
    connection: ConnectionConfig,
    pub(crate) registry: DashMap<u64, ConnectionHandle>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running server
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) state: Arc<ServerState>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("identifier", &self.state.identifier)
            .field("local_addr", &self.state.local_addr)
            .field("connections", &self.state.registry.len())
            .finish()
    }
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    /// Server identifier
    pub fn identifier(&self) -> &str {
        &self.state.identifier
    }

    /// Live connections
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.state
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Identities of connections that completed a subscription
    pub fn subscribers(&self) -> Vec<String> {
        self.state
            .registry
            .iter()
            .filter(|entry| entry.value().is_subscribed())
            .filter_map(|entry| entry.value().identity())
            .collect()
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        if self.state.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down SCP server {}", self.state.identifier);
        for entry in self.state.registry.iter() {
            entry.value().close();
        }
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.state.shutdown.borrow()
    }
}

#[derive(Clone)]
enum Acceptor {
    Plain,
    #[cfg(feature = "tls")]
    Tls(scp_session::tls::TlsServer),
}

impl Acceptor {
    async fn accept(&self, stream: TcpStream) -> anyhow::Result<IoStream> {
        match self {
            Acceptor::Plain => Ok(IoStream::Plain(stream)),
            #[cfg(feature = "tls")]
            Acceptor::Tls(server) => scp_session::tls::accept_tls(server, stream).await,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Acceptor,
    dispatcher: Dispatcher,
    state: Arc<ServerState>,
) {
    let mut shutdown = state.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = async {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            } => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(io) => {
                    let connection = Connection::new(io, Some(peer), state.connection.clone());
                    serve_connection(connection, dispatcher, state).await;
                }
                Err(e) => warn!("Rejected connection from {}: {:#}", peer, e),
            }
        });
    }

    info!("SCP server {} stopped accepting", state.identifier);
}

async fn serve_connection(
    mut connection: Connection,
    dispatcher: Dispatcher,
    state: Arc<ServerState>,
) {
    let handle = connection.handle();
    let id = handle.id();
    let _registration = Registration::new(Arc::clone(&state), handle.clone());
    info!("Accepted connection {} from {:?}", id, handle.peer());

    while let Some(incoming) = connection.accept().await {
        if incoming.mode() == Mode::Subscribe {
            if let Err(e) = accept_subscription(&handle, incoming, &state.identifier).await {
                warn!("Subscription on connection {} failed: {}", id, e);
                break;
            }
            continue;
        }

        let call = incoming.rfi().to_string();
        let mut outgoing = match handle.open_outgoing() {
            Ok(outgoing) => outgoing,
            Err(e) => {
                warn!("Cannot answer {} on connection {}: {}", call, id, e);
                break;
            }
        };
        let mirrored = outgoing.set_rfi(
            incoming.mode(),
            incoming.operation(),
            Parameters::new().with(SID, state.identifier.as_str()),
        );
        if let Err(e) = mirrored {
            warn!("Cannot answer {} on connection {}: {}", call, id, e);
            break;
        }

        match dispatcher.dispatch(incoming, outgoing).await {
            Ok(DispatchOutcome::Handled) => debug!("Handled {} on connection {}", call, id),
            Ok(DispatchOutcome::Unmatched) => {
                debug!("Left {} unanswered on connection {}", call, id)
            }
            Err(e) => warn!("Dispatch of {} on connection {} failed: {}", call, id, e),
        }

        if handle.is_closed() {
            break;
        }
    }
}

/// Registry entry for one served connection, removed when the serve task
/// ends, including by unwinding out of a handler.
struct Registration {
    state: Arc<ServerState>,
    handle: ConnectionHandle,
}

impl Registration {
    fn new(state: Arc<ServerState>, handle: ConnectionHandle) -> Self {
        state.registry.insert(handle.id(), handle.clone());
        Self { state, handle }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let id = self.handle.id();
        self.state.registry.remove(&id);
        info!(
            "Connection {} ({}) ended. Stats: {:?}",
            id,
            self.handle.identity().as_deref().unwrap_or("anonymous"),
            self.handle.stats()
        );
    }
}
