//! Middleware execution pipeline (§4.6).
//!
//! A chain of [`Middleware`] implementors runs in order, each one deciding
//! whether the next stage runs (`Continue`), the request is suspended for
//! later resumption (`Suspend`), or the chain ends early (`Stop`). This
//! replaces a single opaque request handler with a composable pipeline;
//! the crate's pre-existing [`crate::server::connection::Handler`] trait is
//! kept as the terminal stage any chain ultimately bottoms out at.

use crate::http::request::Request;
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    pin::Pin,
};

/// Free-form per-request state threaded alongside the request through the
/// middleware chain. Always carries a `"listener"` entry, overwritten on
/// every request regardless of what a middleware previously stored there
/// (§9: the default `listener` key is always overwritten).
pub struct Env {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl Env {
    pub(crate) fn new(listener: String) -> Self {
        let mut env = Env {
            values: HashMap::new(),
        };
        env.set_listener(listener);
        env
    }

    /// Stores a value under `key`, overwriting any previous one.
    pub fn insert<T: Send + Sync + 'static>(&mut self, key: &'static str, value: T) {
        self.values.insert(key, Box::new(value));
    }

    /// Retrieves a previously stored value of type `T`.
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref())
    }

    /// Overwrites the `"listener"` entry, regardless of what a middleware
    /// previously stored there (§9: always overwritten).
    pub(crate) fn set_listener(&mut self, listener: String) {
        self.insert("listener", listener);
    }

    /// The address this connection was accepted on, as a string (e.g.
    /// `"0.0.0.0:8080"`).
    pub fn listener(&self) -> &str {
        self.get::<String>("listener").map(String::as_str).unwrap_or("")
    }
}

/// The three-way result of one middleware stage (§4.6, §9).
pub enum Outcome {
    /// Hand the request and environment to the next stage in the chain.
    Continue(Request, Env),
    /// Suspend the chain. The wrapped future resolves to the `Outcome` that
    /// resumes it — `Suspend` never nests (a `Suspend` resolving to another
    /// `Suspend` is a contract violation the executor treats as a bug).
    Suspend(Continuation),
    /// End the chain early with a request considered fully handled.
    Stop(Request),
}

/// An opaque in-flight suspension, produced by [`Outcome::Suspend`].
pub struct Continuation(Pin<Box<dyn Future<Output = Outcome> + Send>>);

impl Continuation {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self(Box::pin(future))
    }
}

/// One stage of the middleware chain.
///
/// Object-safe via a boxed-future return (the chain is stored as
/// `Vec<Arc<dyn Middleware>>`, so a generic `impl Future` return, which
/// the rest of this crate's traits use for statically-dispatched async
/// methods, is not an option here).
pub trait Middleware: Send + Sync {
    fn execute(
        &self,
        request: Request,
        env: Env,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>>;
}

/// Drives a middleware chain to completion per §4.6's state machine:
/// `ParsingLine -> ParsingHeaders -> Finalizing -> Executing(i) ->
/// [Suspended(i)] -> ... -> Completed`. The parsing states happen before
/// this executor is ever invoked (they are
/// [`crate::server::connection::HttpConnection::parse`]); this function
/// only drives the `Executing`/`Suspended`/`Completed` portion.
///
/// Returns the final request together with whether the chain was stopped
/// early (`true`) or ran to completion (`false`).
pub(crate) async fn run_chain(
    middlewares: &[std::sync::Arc<dyn Middleware>],
    mut request: Request,
    mut env: Env,
) -> (Request, bool) {
    let mut index = 0;

    loop {
        if index >= middlewares.len() {
            return (request, false);
        }

        let mut outcome = middlewares[index].execute(request, env).await;
        loop {
            match outcome {
                Outcome::Continue(r, e) => {
                    request = r;
                    env = e;
                    index += 1;
                    break;
                }
                Outcome::Stop(r) => return (r, true),
                Outcome::Suspend(continuation) => {
                    outcome = continuation.0.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReqLimits;

    struct CountHeader;
    impl Middleware for CountHeader {
        fn execute(
            &self,
            request: Request,
            mut env: Env,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
            Box::pin(async move {
                env.insert("seen", true);
                Outcome::Continue(request, env)
            })
        }
    }

    struct StopAlways;
    impl Middleware for StopAlways {
        fn execute(
            &self,
            request: Request,
            _env: Env,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
            Box::pin(async move { Outcome::Stop(request) })
        }
    }

    struct SuspendThenContinue;
    impl Middleware for SuspendThenContinue {
        fn execute(
            &self,
            request: Request,
            env: Env,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + '_>> {
            Box::pin(async move {
                Outcome::Suspend(Continuation::new(async move {
                    Outcome::Continue(request, env)
                }))
            })
        }
    }

    #[tokio::test]
    async fn continues_through_chain() {
        let limits = ReqLimits::default();
        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![std::sync::Arc::new(CountHeader)];
        let (_, stopped) = run_chain(&chain, Request::new(&limits), Env::new("test".to_string())).await;
        assert!(!stopped);
    }

    #[tokio::test]
    async fn stop_ends_chain_early() {
        let limits = ReqLimits::default();
        let chain: Vec<std::sync::Arc<dyn Middleware>> =
            vec![std::sync::Arc::new(StopAlways), std::sync::Arc::new(CountHeader)];
        let (_, stopped) = run_chain(&chain, Request::new(&limits), Env::new("test".to_string())).await;
        assert!(stopped);
    }

    #[tokio::test]
    async fn suspend_resumes_into_next_stage() {
        let limits = ReqLimits::default();
        let chain: Vec<std::sync::Arc<dyn Middleware>> = vec![
            std::sync::Arc::new(SuspendThenContinue),
            std::sync::Arc::new(CountHeader),
        ];
        let (_, stopped) = run_chain(&chain, Request::new(&limits), Env::new("test".to_string())).await;
        assert!(!stopped);
    }
}
