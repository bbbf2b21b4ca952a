//! Execution list built at registration time.

use crate::dispatch::Handler;
use crate::helpers::{conductor_handler, reply_handler};
use crate::pattern::Pattern;
use scp_session::{Conductor, RemoteError};
use scp_wire::Mode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// One entry of an execution list
#[derive(Clone)]
pub enum Node {
    /// Terminal handler entry
    Nexus {
        /// Mode the call must carry; `Omni` accepts every mode
        mode: Mode,
        /// Pattern matched against the nexus part of the operation
        pattern: Pattern,
        /// Handler run on a match
        handler: Arc<dyn Handler>,
    },
    /// Named group wrapping another execution list
    Segment {
        /// Pattern matched against the segment part of the operation
        pattern: Pattern,
        /// Entries scanned when the segment matches
        children: Arc<[Node]>,
    },
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Nexus { mode, pattern, .. } => write!(f, "Nexus({} {})", mode, pattern),
            Node::Segment { pattern, children } => f
                .debug_struct("Segment")
                .field("pattern", pattern)
                .field("children", children)
                .finish(),
        }
    }
}

/// Ordered registration of operations
#[derive(Clone, Debug, Default)]
pub struct Executor {
    nodes: Vec<Node>,
}

impl Executor {
    /// Empty execution list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler for one mode
    pub fn nexus<H>(&mut self, mode: Mode, operation: &str, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        debug!("Registering {} {}", mode, operation);
        self.nodes.push(Node::Nexus {
            mode,
            pattern: Pattern::compile(operation),
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a raw handler that accepts every mode
    pub fn omni<H>(&mut self, operation: &str, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.nexus(Mode::Omni, operation, handler)
    }

    /// Register a JSON request/response function
    pub fn reply<A, R, E, F, Fut>(&mut self, operation: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.nexus(Mode::Reply, operation, reply_handler(f))
    }

    /// Register a function driving a conductor after the initial call
    pub fn conductor<A, E, F, Fut>(&mut self, operation: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: Fn(A, Conductor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.nexus(Mode::Conductor, operation, conductor_handler(f))
    }

    /// Mount another execution list under a segment prefix
    pub fn attach(&mut self, prefix: &str, executor: Executor) -> &mut Self {
        debug!("Attaching segment {} ({} entries)", prefix, executor.len());
        self.nodes.push(Node::Segment {
            pattern: Pattern::compile(prefix),
            children: executor.nodes.into(),
        });
        self
    }

    /// Registered entries in order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of top-level entries
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn into_nodes(self) -> Arc<[Node]> {
        self.nodes.into()
    }
}
