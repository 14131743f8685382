//! httpline - A security-first, zero-allocation HTTP/1.x connection core
//!
//! Per-connection request-line/header parser, keep-alive state machine, and
//! middleware execution pipeline for microservices that need fine-grained
//! control over parsing limits and connection lifecycle.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: Persistent connections, pipelining, `Host`-header required.
//! - **HTTP/1.0**: Basic protocol support for legacy clients, `Host` optional.
//! - **PROXY protocol v1**: optional preamble for connections behind a TCP
//!   load balancer, detected automatically from the connection's first bytes.
//!
//! # Features
//!
//! ## 🔒 Security & Protection
//! - **Strict, incremental parsing** - request line, headers, and obs-fold
//!   are parsed under configurable size and count limits; oversized input
//!   fails closed with the mapped status code rather than buffering
//!   unboundedly.
//! - **Fully configurable limits and timeouts** for requests, responses, and
//!   connections.
//! - **Custom connection filtering** - implement the [`ConnectionFilter`]
//!   trait to reject unwanted connections at the TCP level.
//!
//! ## 🚀 Performance & Memory
//! - **Zero-allocation** - no memory allocations after server startup.
//! - **Pre-allocated memory for each connection** - linear and transparent
//!   scaling.
//!
//! ## 🌐 Protocol & Management
//! - **Keep-alive loop** - requests are served strictly in arrival order on
//!   one connection, with unread bytes after one request carried into the
//!   next (pipelining).
//! - **Middleware pipeline** - an ordered [`Middleware`] chain runs ahead of
//!   the terminal [`Handler`], each stage able to continue, [`Outcome::Suspend`]
//!   to release the task, or stop the chain early.
//! - **Storing data between requests** - ability to store data between
//!   requests in a single connection using the [`ConnectionData`] trait.
//!
//! ## 🏭 Production Ready
//! - **Graceful performance degradation** - automatic 503 responses when
//!   the worker pool is saturated.
//! - [**Custom error format**
//!   ](https://docs.rs/httpline/latest/httpline/limits/struct.ServerLimits.html#structfield.json_errors) -
//!   structured JSON (with codes/descriptions) or a plain HTTP response.
//! - **Resource protection** - automatic closure of connections exceeding
//!   set limits.
//!
//! # Quick Start
//!
//! ## 1. Installation
//!
//! Add `httpline` and [`tokio`](https://crates.io/crates/tokio) to your `Cargo.toml`:
//!
//! ```bash
//! cargo add httpline tokio --features tokio/full
//! ```
//! Or manually:
//! ```toml
//! [dependencies]
//! httpline = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! ## 2. Usage example
//! ```no_run
//! use httpline::{Server, Handler, Request, Response, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! For more examples including connection filtering, middleware chains, and
//! advanced configuration, see the crate documentation and the `demos/`
//! directory in the repository.
//!
//! # Use Cases
//!
//! - **High-throughput microservices** - configurable for specific workloads
//! - **Resource-constrained environments** - predictable memory usage
//! - **Internal APIs** - security-conscious defaults
//! - **Performance-critical applications** - zero-allocation design
//! - **Legacy system integration** - HTTP/1.0 compatibility
pub(crate) mod http {
    pub mod query;
    pub(crate) mod host;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;
pub mod middleware;
pub(crate) mod proxy;

pub use crate::{
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    middleware::{Continuation, Env, Middleware, Outcome},
    proxy::ProxyInfo,
    server::{
        connection::{ConnectionData, ConnectionFilter},
        server_impl::{Handler, Server, ServerBuilder},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use httpline::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        // `<()>` to check functionality
        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
