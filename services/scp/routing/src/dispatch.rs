//! Walking the execution list for one incoming call.
//!
//! Entries are tried in registration order. A handler may hand the call on
//! with [`Next::proceed`], which resumes the scan right after the entry that
//! ran; a handler that does not proceed ends dispatch.

use crate::error::Result;
use crate::table::{Executor, Node};
use futures::future::BoxFuture;
use scp_session::{IncomingExchange, OutgoingExchange};
use scp_wire::Mode;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Value returned by handlers
pub type HandlerResult = Result<()>;

/// Operation handler
pub trait Handler: Send + Sync {
    /// Serve one call
    fn call(
        &self,
        incoming: IncomingExchange,
        outgoing: OutgoingExchange,
        next: Next,
    ) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(IncomingExchange, OutgoingExchange, Next) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(
        &self,
        incoming: IncomingExchange,
        outgoing: OutgoingExchange,
        next: Next,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(incoming, outgoing, next))
    }
}

/// How dispatch of one call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ended the chain without proceeding past the last entry
    Handled,
    /// The scan ran off the end of the list; the call stays unanswered
    Unmatched,
}

#[derive(Debug)]
struct Target {
    mode: Mode,
    segment: Option<String>,
    nexus: String,
    unmatched: AtomicBool,
}

struct Scope {
    nodes: Arc<[Node]>,
    index: usize,
    segment_matched: bool,
}

/// Continuation handed to every handler
pub struct Next {
    target: Arc<Target>,
    scopes: Vec<Scope>,
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("target", &self.target)
            .field("depth", &self.scopes.len())
            .finish()
    }
}

impl Next {
    fn next_handler(&mut self) -> Option<Arc<dyn Handler>> {
        while let Some(scope) = self.scopes.last_mut() {
            let Some(node) = scope.nodes.get(scope.index).cloned() else {
                self.scopes.pop();
                continue;
            };
            scope.index += 1;
            let segment_matched = scope.segment_matched;

            match node {
                Node::Segment { pattern, children } => {
                    let Some(segment) = self.target.segment.as_deref() else {
                        continue;
                    };
                    if !segment_matched && pattern.is_match(segment) {
                        self.scopes.push(Scope {
                            nodes: children,
                            index: 0,
                            segment_matched: true,
                        });
                    }
                }
                Node::Nexus {
                    mode,
                    pattern,
                    handler,
                } => {
                    let mode_matches = mode == Mode::Omni || mode == self.target.mode;
                    if mode_matches
                        && segment_matched == self.target.segment.is_some()
                        && pattern.is_match(&self.target.nexus)
                    {
                        return Some(handler);
                    }
                }
            }
        }
        None
    }

    /// Resume the scan after the current entry.
    ///
    /// Reports [`DispatchOutcome::Unmatched`] when any handler further down
    /// the chain proceeded past the last matching entry.
    pub async fn proceed(
        mut self,
        mut incoming: IncomingExchange,
        outgoing: OutgoingExchange,
    ) -> Result<DispatchOutcome> {
        match self.next_handler() {
            Some(handler) => {
                let target = Arc::clone(&self.target);
                handler.call(incoming, outgoing, self).await?;
                if target.unmatched.load(Ordering::Acquire) {
                    Ok(DispatchOutcome::Unmatched)
                } else {
                    Ok(DispatchOutcome::Handled)
                }
            }
            None => {
                debug!("No handler for {}", incoming.rfi());
                self.target.unmatched.store(true, Ordering::Release);
                drop(outgoing);
                incoming.drain().await?;
                Ok(DispatchOutcome::Unmatched)
            }
        }
    }
}

/// Immutable, shareable execution list
#[derive(Clone, Debug)]
pub struct Dispatcher {
    nodes: Arc<[Node]>,
}

impl Dispatcher {
    /// Freeze an executor's registrations
    pub fn new(executor: Executor) -> Self {
        Self {
            nodes: executor.into_nodes(),
        }
    }

    /// Route one call to the first matching handler
    pub async fn dispatch(
        &self,
        incoming: IncomingExchange,
        outgoing: OutgoingExchange,
    ) -> Result<DispatchOutcome> {
        let (segment, nexus) = incoming.rfi().split_operation();
        let target = Target {
            mode: incoming.mode(),
            segment: segment.map(str::to_string),
            nexus: nexus.to_string(),
            unmatched: AtomicBool::new(false),
        };
        let next = Next {
            target: Arc::new(target),
            scopes: vec![Scope {
                nodes: Arc::clone(&self.nodes),
                index: 0,
                segment_matched: false,
            }],
        };
        next.proceed(incoming, outgoing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoutingError;
    use crate::testing::{exchange_pair, Harness};
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    fn record(trace: &Trace, name: &'static str, proceed: bool) -> impl Handler {
        let trace = Arc::clone(trace);
        move |incoming: IncomingExchange, outgoing: OutgoingExchange, next: Next| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push(name);
                if proceed {
                    next.proceed(incoming, outgoing).await?;
                }
                Ok::<(), RoutingError>(())
            }
        }
    }

    async fn run(dispatcher: &Dispatcher, mode: Mode, operation: &str) -> DispatchOutcome {
        let mut harness = Harness::new();
        let (incoming, outgoing) = exchange_pair(&mut harness, mode, operation, b"").await;
        dispatcher.dispatch(incoming, outgoing).await.unwrap()
    }

    #[tokio::test]
    async fn test_proceed_chains_in_registration_order() {
        let trace = Trace::default();
        let mut executor = Executor::new();
        executor
            .omni("*", record(&trace, "A", true))
            .nexus(Mode::Reply, "echo", record(&trace, "B", true))
            .nexus(Mode::Reply, "ec*", record(&trace, "C", false))
            .nexus(Mode::Reply, "echo", record(&trace, "D", false));
        let dispatcher = Dispatcher::new(executor);

        let outcome = run(&dispatcher, Mode::Reply, "echo").await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(*trace.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_mode_must_match_unless_omni() {
        let trace = Trace::default();
        let mut executor = Executor::new();
        executor
            .nexus(Mode::Reply, "op", record(&trace, "reply", false))
            .omni("op", record(&trace, "omni", false));
        let dispatcher = Dispatcher::new(executor);

        run(&dispatcher, Mode::Conductor, "op").await;
        run(&dispatcher, Mode::Reply, "op").await;
        assert_eq!(*trace.lock().unwrap(), vec!["omni", "reply"]);
    }

    #[tokio::test]
    async fn test_segments_scope_their_entries() {
        let trace = Trace::default();
        let mut billing = Executor::new();
        billing.nexus(Mode::Reply, "charge", record(&trace, "billing", false));
        let mut executor = Executor::new();
        executor
            .attach("Billing", billing)
            .nexus(Mode::Reply, "charge", record(&trace, "top", false));
        let dispatcher = Dispatcher::new(executor);

        assert_eq!(
            run(&dispatcher, Mode::Reply, "Billing.charge").await,
            DispatchOutcome::Handled
        );
        assert_eq!(
            run(&dispatcher, Mode::Reply, "charge").await,
            DispatchOutcome::Handled
        );
        assert_eq!(
            run(&dispatcher, Mode::Reply, "Billing.refund").await,
            DispatchOutcome::Unmatched
        );
        assert_eq!(
            run(&dispatcher, Mode::Reply, "Shipping.charge").await,
            DispatchOutcome::Unmatched
        );
        assert_eq!(*trace.lock().unwrap(), vec!["billing", "top"]);
    }

    #[tokio::test]
    async fn test_proceed_leaves_segment_and_resumes_outer_scan() {
        let trace = Trace::default();
        let mut inner = Executor::new();
        inner.omni("*", record(&trace, "inner", true));
        let mut other = Executor::new();
        other.omni("*", record(&trace, "wild", false));
        let mut executor = Executor::new();
        executor
            .attach("Bill*", inner)
            .omni("*", record(&trace, "bare", false))
            .attach("*", other);
        let dispatcher = Dispatcher::new(executor);

        assert_eq!(
            run(&dispatcher, Mode::Broadcast, "Billing.x").await,
            DispatchOutcome::Handled
        );
        assert_eq!(*trace.lock().unwrap(), vec!["inner", "wild"]);
    }

    #[tokio::test]
    async fn test_proceeding_past_the_last_entry_is_unmatched() {
        let trace = Trace::default();
        let mut executor = Executor::new();
        executor
            .omni("*", record(&trace, "audit", true))
            .nexus(Mode::Reply, "echo", record(&trace, "echo", false));
        let dispatcher = Dispatcher::new(executor);

        assert_eq!(
            run(&dispatcher, Mode::Reply, "missing").await,
            DispatchOutcome::Unmatched
        );
        assert_eq!(
            run(&dispatcher, Mode::Reply, "echo").await,
            DispatchOutcome::Handled
        );
        assert_eq!(*trace.lock().unwrap(), vec!["audit", "audit", "echo"]);
    }

    #[tokio::test]
    async fn test_unmatched_call_is_drained() {
        let dispatcher = Dispatcher::new(Executor::new());
        let mut harness = Harness::new();
        let (incoming, outgoing) =
            exchange_pair(&mut harness, Mode::Reply, "nothing", b"[1,2,3]").await;

        assert_eq!(
            dispatcher.dispatch(incoming, outgoing).await.unwrap(),
            DispatchOutcome::Unmatched
        );
    }
}
