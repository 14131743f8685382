use crate::{
    errors::ErrorKind,
    http::{
        request::{Parser, Request},
        response::Response,
        types::{StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    middleware::{self, Env, Middleware},
    proxy,
    server::server_impl::{AllLimits, Handler},
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::{sleep, Instant as Deadline},
};

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,
    middlewares: Vec<Arc<dyn Middleware>>,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    // Held empty between requests so the live `Request` can be moved by
    // value into `middleware::run_chain` and back without a heap
    // allocation (§4.6, §9 "zero allocations after startup").
    scratch_request: Option<Request>,
    pub(crate) response: Response,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(handler: Arc<H>, limits: AllLimits, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            handler,
            connection_data: S::new(),
            middlewares,

            connection: Connection::new(),
            parser: Parser::new(&limits.2),
            request: Request::new(&limits.2),
            scratch_request: Some(Request::new(&limits.2)),
            response: Response::new(&limits.3),

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,
        }
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.carry_residual();
        self.request.reset();
        self.response.reset(&self.resp_limits);
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) async fn run(
        &mut self,
        stream: &mut TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        self.request.set_peer(client_addr, server_addr);
        let tls = self.server_limits.tls;

        match self.impl_run(stream, tls).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(error) if error.is_silent() => Ok(()),
            Err(error) => {
                tracing::debug!(peer = %client_addr, ?error, "aborting connection with error response");
                self.conn_limits
                    .send_error(
                        stream,
                        error,
                        self.request.version(),
                        self.server_limits.json_errors,
                    )
                    .await
            }
        }
    }

    #[inline]
    pub(crate) async fn impl_run(
        &mut self,
        stream: &mut TcpStream,
        tls: bool,
    ) -> Result<(), ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();

        self.decode_proxy_preamble(stream).await?;

        while !self.is_expired() {
            self.reset_request_response();

            loop {
                match self.parse(tls) {
                    Ok(version) => {
                        self.response.version = version;
                        break;
                    }
                    Err(ErrorKind::Incomplete) => self.read_more(stream).await?,
                    Err(error) => return Err(error),
                }
            }

            self.run_request(stream).await?;

            if !self.response.keep_alive {
                break;
            }
            self.connection.request_count += 1;
        }

        Ok(())
    }

    /// Reads one PROXY protocol v1 preamble line before the first request,
    /// triggered purely by content - the connection opens with exactly
    /// `"PROXY "` - never by configuration (§4.2). Anything else is left
    /// untouched in the buffer for the first request's own parse.
    #[inline]
    async fn decode_proxy_preamble(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        loop {
            match proxy::has_preamble(&self.parser.buffer[..self.parser.len]) {
                Some(true) => break,
                Some(false) => return Ok(()),
                None => self.read_more(stream).await?,
            }
        }

        loop {
            match proxy::find_line_end(&self.parser.buffer[..self.parser.len]) {
                Ok(cr) => {
                    let info = proxy::parse_line(&self.parser.buffer[..cr])?;
                    self.parser.position = cr + 2;
                    self.request.set_proxy_info(Some(info));
                    self.parser.carry_residual();
                    return Ok(());
                }
                Err(ErrorKind::Incomplete) => self.read_more(stream).await?,
                Err(error) => return Err(error),
            }
        }
    }

    /// Reads more bytes into the parser's buffer, applying the per-read
    /// idle deadline (§4.1). A timeout with nothing buffered yet is a
    /// quiet, expected end to an idle keep-alive wait; a timeout with a
    /// request already in flight is reported as [`ErrorKind::ReadTimeoutDuringHeaders`].
    #[inline]
    async fn read_more(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        let deadline = Deadline::now() + self.conn_limits.timeout;

        match self.parser.fill_buffer(stream, Some(deadline)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if self.parser.len > 0 {
                    Err(ErrorKind::ReadTimeoutDuringHeaders)
                } else {
                    Err(ErrorKind::TransportClosed)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drives the parsed request through the middleware chain and the
    /// terminal [`Handler`], then writes the response. The `Handler` always
    /// runs, even when the chain reports an early stop, since it alone can
    /// produce the `Response` (§4.6, §9).
    #[inline]
    async fn run_request(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        let env = Env::new(self.request.server_addr().to_string());

        let placeholder = self
            .scratch_request
            .take()
            .expect("scratch_request is always Some between requests");
        let request = std::mem::replace(&mut self.request, placeholder);

        let (request, stopped) = middleware::run_chain(&self.middlewares, request, env).await;
        if stopped {
            tracing::trace!("middleware chain stopped early");
        }
        self.scratch_request = Some(std::mem::replace(&mut self.request, request));

        self.handler
            .handle(&mut self.connection_data, &self.request, &mut self.response)
            .await;

        // §4.7 step 1: a stopped chain (or a handler that forgot to) may
        // leave the response untouched - never write an empty buffer.
        if self.response.is_unset() {
            tracing::trace!("handler produced no response; synthesizing 204");
            self.response.status(StatusCode::NoContent).body("");
        }

        self.conn_limits
            .write_bytes(stream, self.response.buffer())
            .await?;

        Ok(())
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes(
        &self,
        stream: &mut TcpStream,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> bool {
        !self.response.keep_alive
            || self.connection.request_count >= self.conn_limits.max_keepalive
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use httpline::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
///
/// Check out a [real-world example
/// ](https://github.com/AmakeSashaDev/httpline/blob/main/examples/request_counter.rs)
/// (well, almost)
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use httpline::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// File-based IP blacklist:
/// ```
/// use std::net::SocketAddr;
/// use httpline::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     db: DatabaseClient
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// Two-stage filtering with cache:
/// ```
/// use std::{collections::HashSet, sync::RwLock, net::{SocketAddr, IpAddr}};
/// use httpline::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     cache: RwLock<HashSet<IpAddr>>,
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         let Ok(guard) = self.cache.read() else {
///             return Err(err_resp.status(StatusCode::InternalServerError)
///                 .body("Internal server error"));
///         };
///
///         if guard.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             let Ok(mut guard) = self.cache.write() else {
///                 return Err(err_resp.status(StatusCode::InternalServerError)
///                     .body("Internal server error"));
///             };
///             guard.insert(client_addr.ip());
///
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds.Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    /// - Machine learning inference
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

//

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                connection_data: (),
                middlewares: Vec::new(),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                scratch_request: Some(Request::new(&req_limits)),
                response: Response::new(&resp_limits),

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                req_limits,
                resp_limits,
            }
        }
    }
}

#[cfg(test)]
mod proxy_preamble_tests {
    use super::*;
    use crate::StatusCode;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    struct EchoProxyInfo;

    impl Handler<()> for EchoProxyInfo {
        async fn handle(&self, _: &mut (), request: &Request, r: &mut Response) -> Handled {
            let body = if request.proxy_info().is_some() { "proxy" } else { "plain" };
            r.status(StatusCode::Ok).body(body)
        }
    }

    /// §4.2: the decoder triggers purely on the connection opening with
    /// `"PROXY "`, with no configuration gate - under an untouched
    /// `ServerLimits::default()`, a PROXY v1 preamble followed by a normal
    /// request must still be decoded.
    #[tokio::test]
    async fn proxy_preamble_decoded_under_default_limits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            let server_addr = stream.local_addr().unwrap();

            let mut conn = HttpConnection::<EchoProxyInfo, ()>::new(
                Arc::new(EchoProxyInfo),
                (
                    ServerLimits::default(),
                    ConnLimits::default(),
                    ReqLimits::default().precalculate(),
                    RespLimits::default(),
                ),
                Vec::new(),
            );

            conn.run(&mut stream, peer, server_addr).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                b"PROXY TCP4 10.0.0.1 10.0.0.2 1111 2222\r\n\
                  GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server.await.unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("proxy"), "expected decoded proxy info, got: {text}");
    }

    /// A connection that does not open with `"PROXY "` must be parsed as a
    /// normal request - the content check must not consume or misinterpret
    /// ordinary request bytes.
    #[tokio::test]
    async fn plain_request_not_mistaken_for_preamble() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            let server_addr = stream.local_addr().unwrap();

            let mut conn = HttpConnection::<EchoProxyInfo, ()>::new(
                Arc::new(EchoProxyInfo),
                (
                    ServerLimits::default(),
                    ConnLimits::default(),
                    ReqLimits::default().precalculate(),
                    RespLimits::default(),
                ),
                Vec::new(),
            );

            conn.run(&mut stream, peer, server_addr).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server.await.unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("plain"), "expected no proxy info, got: {text}");
    }
}
