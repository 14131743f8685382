//! Connection, request, and response limits.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Request Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! # Examples
//!
//! ```no_run
//! # httpline::impt_default_handler!{MyHandler}
//! use httpline::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             timeout: Duration::from_secs(5),
//!             max_keepalive: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_headers: 18,
//!             body_size: 16 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and performance behavior.
///
/// Configures how the server handles connection admission, worker pools,
/// and overload protection with tunable parameters for different workloads.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue if full? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [---------]   Yes   /--------------------------\   No   [------]
/// [ Worker  ] <====== | Is there a free handler? | =====> [ Wait ]
/// [---------]         \--------------------------/        [------]
/// ```
///
/// A worker process is a continuously running asynchronous task, created
/// once during initialization, that loops over a shared queue fed by the
/// accept loop. This design avoids spawning a task per connection.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections being processed (default: `100`).
    pub max_connections: usize,

    /// Maximum number of accepted TCP connections waiting in the admission queue
    /// (default: `250`). Overflow is answered with an immediate `503`.
    pub max_pending_connections: usize,

    /// Strategy for worker task waiting behavior (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated worker tasks for queue-overflow `503` responses (default: `1`).
    /// Set to `0` to silently close overflow connections instead.
    pub count_503_handlers: usize,

    /// Format for synthesized error responses (default: `true` — JSON body with a `code` field).
    pub json_errors: bool,

    /// Whether the accepted stream is TLS-terminated upstream of this
    /// server (default: `false`). This crate does not terminate TLS
    /// itself; set this so `Host`-header port resolution defaults to
    /// `443` instead of `80` when a request omits an explicit port.
    pub tls: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
            tls: false,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Measured at 97-99% CPU
    /// under load; prefer [`Sleep`](Self::Sleep) unless latency is paramount.
    Yield,
    /// While waiting, uses [`tokio::time::sleep()`].
    Sleep(Duration),
}

/// Connection-level limits and timeouts.
///
/// `timeout` and `max_keepalive` are the two fields the keep-alive loop
/// consults directly (they back `timeout` and `max_keepalive` from the
/// connection configuration); the others are ambient connection hygiene the
/// reference crate already enforced.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle-read budget per `recv` (default: `5 seconds`).
    ///
    /// Every read computes an absolute deadline `now() + timeout`; a read
    /// that cannot complete before the deadline fails with a timeout rather
    /// than blocking indefinitely. This is the primary defense against
    /// slowloris-style connections.
    pub timeout: Duration,

    /// Maximum duration to wait for writing a response (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Maximum number of requests served on one connection (default: `100`).
    /// Once reached, the keep-alive loop advertises `connection: close` and
    /// exits after the current response.
    pub max_keepalive: usize,

    /// Maximum number of consecutive empty lines tolerated before the first
    /// request line of a connection (default: `5`). See
    /// [`ReqLimits::max_empty_lines`] for the per-parse-cycle counterpart —
    /// both fields share one value in [`ConnLimits::default`].
    pub max_empty_lines: usize,

    /// Maximum lifetime of a connection from establishment to closure
    /// (default: `2 minutes`). Final safety net independent of `timeout`
    /// and `max_keepalive`.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            socket_write_timeout: Duration::from_secs(3),
            max_keepalive: 100,
            max_empty_lines: 5,
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation strategy.
///
/// Each TCP connection pre-allocates a fixed-size buffer based on these
/// limits:
///
/// ```text
/// Total Buffer = Request line + (Headers * Header line) + Body + CRLF
/// ```
///
/// # Trade-off Considerations
///
/// - **Small limits**: Less memory, faster parsing, but may reject
///   legitimate requests.
/// - **Large limits**: More memory overhead, but handles complex APIs and
///   large payloads.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-line length in bytes, method through the terminating
    /// `CRLF` (default: `4096`). Exceeding this fails with `414`.
    pub max_request_line_length: usize,
    /// Maximum number of consecutive empty lines tolerated while scanning
    /// for the request line (default: `5`). Exceeding this fails with `400`.
    pub max_empty_lines: usize,

    /// Maximum number of headers per request (default: `100`). Exceeding
    /// this fails with `400`.
    pub max_headers: usize,
    /// Maximum header name length in bytes (default: `64`).
    pub max_header_name_length: usize,
    /// Maximum header value length in bytes, measured over the value-phase
    /// bytes observed before folding/trimming (default: `4096`).
    pub max_header_value_length: usize,

    /// Maximum number of path segments in the request target (default: `8`).
    pub url_parts: usize,
    /// Maximum query string length, including the leading `?` (default: `256`).
    pub url_query_size: usize,
    /// Maximum number of query parameters (default: `16`).
    pub url_query_parts: usize,

    /// Maximum request body size in bytes (default: `4 KB`). Consulted only
    /// by the external body collaborator when draining before keep-alive
    /// reuse; this crate's parser never reads the body itself.
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_request_line_length: 4096,
            max_empty_lines: 5,

            max_headers: 100,
            max_header_name_length: 64,
            max_header_value_length: 4096,

            url_parts: 8,
            url_query_size: 256,
            url_query_parts: 16,

            body_size: 4 * 1024,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated memory buffer size required per connection.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();
        self.precalc.req_without_body = self.precalc.buffer - self.body_size;

        self
    }

    #[inline(always)]
    // Request line + empty-line tolerance slack + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line
            + (self.max_empty_lines * 2)
            + self.max_headers * self.precalc.h_line
            + 2
            + self.body_size
    }

    #[inline(always)]
    fn first_line(&self) -> usize {
        self.max_request_line_length + 2
    }

    #[inline(always)]
    // Name ": " Value "\r\n"
    fn h_line(&self) -> usize {
        self.max_header_name_length + self.max_header_value_length + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) req_without_body: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`).
    pub default_capacity: usize,
    /// Maximum allowed buffer capacity kept across requests (default: `8192 B`).
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}
