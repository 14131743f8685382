use crate::{
    errors::*,
    http::types::{self, Header, HeaderMap, Method},
    limits::ReqLimits,
    proxy::ProxyInfo,
    query::Query,
    server::connection::HttpConnection,
    ConnectionData, Handler, Url, Version,
};
use memchr::memchr;
use std::{
    io, mem,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep_until, Instant},
};

const UNKNOWN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// High-performance HTTP request representation.
///
/// Uses strategic memory alignment for optimal cache performance.
/// All data is zero-copy referenced from the original input.
#[derive(Debug, Clone, PartialEq)]
#[repr(align(128))]
pub struct Request {
    method: Method,
    url: Url,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    body: Option<&'static [u8]>,
    pub(crate) host: &'static [u8],
    pub(crate) port: u16,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    proxy_info: Option<ProxyInfo>,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method(b"GET"),
            url: Url::new(limits),
            version: Version::Http11,
            headers: HeaderMap::new(limits.max_headers),
            body: None,
            host: b"",
            port: 0,
            client_addr: UNKNOWN_ADDR,
            server_addr: UNKNOWN_ADDR,
            proxy_info: None,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.method = Method(b"GET");
        self.url.clear();
        self.version = Version::Http11;
        self.headers.reset();
        self.body = None;
        self.host = b"";
        self.port = 0;
        // client_addr/server_addr/proxy_info are per-connection, not
        // per-request: `reset` runs between pipelined requests on the same
        // socket, where they stay identical, so leave them untouched.
    }

    #[inline(always)]
    pub(crate) fn set_peer(&mut self, client_addr: SocketAddr, server_addr: SocketAddr) {
        self.client_addr = client_addr;
        self.server_addr = server_addr;
    }

    #[inline(always)]
    pub(crate) fn set_proxy_info(&mut self, proxy_info: Option<ProxyInfo>) {
        self.proxy_info = proxy_info;
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    /// Uses linear search.
    ///
    /// # Arguments
    /// - `name`: Header name bytes (e.g., `b"content-type"`)
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// Returns the request body if present.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    /// Returns the resolved request host, lower-cased, stripped of any
    /// `[...]` IPv6 brackets. Empty when the request was HTTP/1.0 with no
    /// `Host` header.
    #[inline(always)]
    pub const fn host(&self) -> &[u8] {
        self.host
    }

    /// Returns the resolved request port: from the `Host` header if given,
    /// otherwise the transport's scheme-default (443 for TLS, 80 otherwise).
    #[inline(always)]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The TCP peer address for this connection. Behind a PROXY-protocol
    /// load balancer this is the balancer's own address - use
    /// [`Request::proxy_info`] for the original client.
    #[inline(always)]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The local address this connection was accepted on.
    #[inline(always)]
    pub const fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The decoded PROXY protocol v1 preamble, if the connection opened
    /// with one.
    #[inline(always)]
    pub const fn proxy_info(&self) -> Option<&ProxyInfo> {
        self.proxy_info.as_ref()
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// Resumable across `Incomplete`: each step only runs once per request,
    /// guarded by [`Parser::stage`], so a retry after more bytes arrive
    /// continues from the step that ran out of data rather than re-running
    /// steps that already consumed and advanced past their own input.
    #[inline]
    pub(crate) fn parse(&mut self, tls: bool) -> Result<Version, ErrorKind> {
        if self.parser.stage < ParseStage::Method {
            self.skip_empty_lines()?;
            self.parser.stage = ParseStage::Method;
        }
        if self.parser.stage < ParseStage::Url {
            self.parse_method()?;
            self.parser.stage = ParseStage::Url;
        }
        if self.parser.stage < ParseStage::Version {
            self.parse_url()?;
            self.parser.stage = ParseStage::Version;
        }
        if self.parser.stage < ParseStage::Headers {
            self.check_version()?;
            self.parser.stage = ParseStage::Headers;
        }
        if self.parser.stage < ParseStage::Body {
            self.parse_headers()?;
            self.parser.stage = ParseStage::Body;
        }
        if self.parser.stage < ParseStage::Done {
            self.finalize_host_port(tls)?;
            self.check_body()?;
            self.parser.stage = ParseStage::Done;
        }

        Ok(self.request.version)
    }
}

// Preamble / request line
impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// §4.3 step 1: tolerate up to `max_empty_lines` blank lines before the
    /// request line proper.
    #[inline]
    fn skip_empty_lines(&mut self) -> Result<(), ErrorKind> {
        let max_empty = self.req_limits.max_empty_lines;
        let mut seen = 0usize;

        loop {
            let parser = &self.parser;
            match parser.get_slice(parser.position, 1) {
                None => return Err(ErrorKind::Incomplete),
                // A lone `LF` can never become a `CRLF` empty line no matter
                // what follows it - §4.3 step 1 treats a leading bare `LF`
                // as malformed, not as a blank line to tolerate.
                Some(b"\n") => return Err(ErrorKind::MalformedRequestLine),
                Some(b"\r") => match parser.get_slice(parser.position, 2) {
                    Some(b"\r\n") => {}
                    // Bare `CR` not followed by `LF`, or `CR` awaiting more
                    // bytes to know: stop here and let the request-line scan
                    // (or a further `Incomplete` retry through it) decide.
                    _ => return Ok(()),
                },
                Some(_) => return Ok(()),
            }

            if seen >= max_empty {
                return Err(ErrorKind::TooManyEmptyLines);
            }
            seen += 1;
            self.parser.position += 2;
        }
    }

    #[inline]
    fn parse_method(&mut self) -> Result<(), ErrorKind> {
        let start = self.parser.position;
        let budget = self.scan_budget(start);
        let slice = self
            .parser
            .get_slice(start, budget)
            .ok_or(ErrorKind::Incomplete)?;

        let len = Method::scan(slice).map_err(|e| self.promote_incomplete(e, budget))?;
        let bytes = self
            .parser
            .get_slice_static(start, len)
            .ok_or(ErrorKind::Incomplete)?;

        self.request.method = Method(bytes);
        self.parser.position = start + len + 1;
        Ok(())
    }

    // Target bytes until `SP`/`?`/`#`/`CR`; a bare `CR` before the terminator is malformed.
    #[inline]
    fn scan_target_stop(slice: &[u8], extra: &[u8]) -> Option<(usize, bool)> {
        let mut best: Option<(usize, bool)> = None;
        for &needle in extra.iter().chain(std::iter::once(&b'\r')) {
            if let Some(pos) = memchr(needle, slice) {
                let is_cr = needle == b'\r';
                best = match best {
                    Some((p, _)) if p <= pos => best,
                    _ => Some((pos, is_cr)),
                };
            }
        }
        best
    }

    #[inline]
    fn parse_url(&mut self) -> Result<(), ErrorKind> {
        let start = self.parser.position;

        if self.parser.get_slice(start, 2) == Some(b"* ") {
            self.request.url.target = b"*";
            self.request.url.path = b"*";
            self.parser.position = start + 2;
            return Ok(());
        }

        let budget = self.scan_budget(start);
        let slice = self
            .parser
            .get_slice(start, budget)
            .ok_or(ErrorKind::MalformedRequestLine)?;

        const PREFIXES: [&[u8]; 4] = [b"http://", b"https://", b"HTTP://", b"HTTPS://"];
        let prefix_len = PREFIXES.iter().find(|p| slice.starts_with(*p)).map(|p| p.len());

        let path_start_rel = match prefix_len {
            Some(plen) => {
                let (rel, _) = Self::scan_target_stop(&slice[plen..], &[b'/', b'?', b'#', b' '])
                    .ok_or_else(|| self.line_length_error(slice.len()))?;
                plen + rel
            }
            None => 0,
        };

        let is_root = slice.get(path_start_rel) == Some(&b'/');
        if prefix_len.is_none() && !is_root {
            return Err(ErrorKind::MalformedRequestLine);
        }

        let path_slice = &slice[path_start_rel..];
        let (path_end_rel, hit_cr) = Self::scan_target_stop(path_slice, &[b' ', b'?', b'#'])
            .ok_or_else(|| self.line_length_error(slice.len()))?;
        if hit_cr {
            return Err(ErrorKind::MalformedRequestLine);
        }

        let path_abs_start = start + path_start_rel;
        let path_abs_end = path_abs_start + path_end_rel;

        {
            let url = &mut self.request.url;
            url.parts.clear();
            if path_abs_end > path_abs_start {
                for seg in self.parser.buffer[path_abs_start..path_abs_end].split(|&b| b == b'/') {
                    if !seg.is_empty() {
                        if url.parts.len() >= url.parts.capacity() {
                            return Err(ErrorKind::MalformedRequestLine);
                        }
                        let rel = seg.as_ptr() as usize - self.parser.buffer.as_ptr() as usize;
                        let part = self
                            .parser
                            .get_slice_static(rel, seg.len())
                            .ok_or(ErrorKind::MalformedRequestLine)?;
                        url.parts.push(part);
                    }
                }
            }
        }

        let path_bytes = if path_abs_end > path_abs_start {
            self.parser
                .get_slice_static(path_abs_start, path_abs_end - path_abs_start)
                .ok_or(ErrorKind::MalformedRequestLine)?
        } else {
            b"/"
        };
        self.request.url.path = path_bytes;

        // Query / fragment / terminating SP.
        let mut cursor = path_abs_end;
        let mut query_bytes: Option<&'static [u8]> = None;

        if self.parser.get_slice(cursor, 1) == Some(b"?") {
            let q_budget = self.scan_budget(cursor);
            let q_slice = self
                .parser
                .get_slice(cursor, q_budget)
                .ok_or(ErrorKind::MalformedRequestLine)?;
            let (q_end_rel, hit_cr) = Self::scan_target_stop(q_slice, &[b' ', b'#'])
                .ok_or_else(|| self.line_length_error(q_slice.len()))?;
            if hit_cr {
                return Err(ErrorKind::MalformedRequestLine);
            }
            if q_end_rel > self.req_limits.url_query_size {
                return Err(ErrorKind::RequestLineTooLong);
            }

            let q_bytes = self
                .parser
                .get_slice_static(cursor, q_end_rel)
                .ok_or(ErrorKind::MalformedRequestLine)?;

            let limit = self.request.url.query_parts.capacity();
            Query::parse_into(&mut self.request.url.query_parts, q_bytes, limit)?;
            query_bytes = Some(q_bytes);
            cursor += q_end_rel;
        }
        self.request.url.query = query_bytes;

        if self.parser.get_slice(cursor, 1) == Some(b"#") {
            let f_budget = self.scan_budget(cursor);
            let f_slice = self
                .parser
                .get_slice(cursor, f_budget)
                .ok_or(ErrorKind::MalformedRequestLine)?;
            let (f_end_rel, hit_cr) = Self::scan_target_stop(f_slice, &[b' '])
                .ok_or_else(|| self.line_length_error(f_slice.len()))?;
            if hit_cr {
                return Err(ErrorKind::MalformedRequestLine);
            }
            cursor += f_end_rel;
        }

        if self.parser.get_slice(cursor, 1) != Some(b" ") {
            return Err(ErrorKind::MalformedRequestLine);
        }

        let target_len = cursor - start;
        self.request.url.target = self
            .parser
            .get_slice_static(start, target_len)
            .ok_or(ErrorKind::MalformedRequestLine)?;

        self.parser.position = cursor + 1;
        Ok(())
    }

    #[inline]
    fn check_version(&mut self) -> Result<(), ErrorKind> {
        let slice = self
            .parser
            .get_slice(self.parser.position, 10)
            .ok_or(ErrorKind::Incomplete)?;

        let version = Version::from_bytes(slice)?;
        self.request.version = version;
        self.response.version = version;
        self.response.keep_alive = matches!(version, Version::Http11);
        self.parser.position += 10;

        Ok(())
    }

    #[inline]
    fn scan_budget(&self, start: usize) -> usize {
        self.parser
            .len
            .saturating_sub(start)
            .min(self.req_limits.max_request_line_length + 1)
    }

    /// A scan over a `scan_budget`-bounded window found no terminator.
    /// `scanned` is that window's length: if it already hit the cap
    /// (`max_request_line_length + 1`), every available byte under the
    /// limit was checked and none worked, so this is a genuine overlong
    /// line. Otherwise the window was short only because the buffer ran
    /// dry, and more bytes off the wire may still complete it.
    #[inline]
    fn line_length_error(&self, scanned: usize) -> ErrorKind {
        if scanned > self.req_limits.max_request_line_length {
            ErrorKind::RequestLineTooLong
        } else {
            ErrorKind::Incomplete
        }
    }

    /// Re-homes an [`ErrorKind::Incomplete`] coming out of a scan that also
    /// validates content (like [`Method::scan`]): once `scanned` bytes have
    /// already been examined and still no terminator turned up, "need more
    /// data" becomes "this line is too long". Any other error (genuine
    /// content malformation) passes through unchanged.
    #[inline]
    fn promote_incomplete(&self, err: ErrorKind, scanned: usize) -> ErrorKind {
        match err {
            ErrorKind::Incomplete if scanned > self.req_limits.max_request_line_length => {
                ErrorKind::RequestLineTooLong
            }
            other => other,
        }
    }
}

// Parse headers
impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn parse_headers(&mut self) -> Result<(), ErrorKind> {
        loop {
            match self.parse_header()? {
                Some(header) => {
                    if !self.parse_special_header(&header)? {
                        self.request.headers.headers.push(header);
                    }
                }
                None => return Ok(()),
            }
        }
    }

    #[inline]
    fn parse_header(&mut self) -> Result<Option<Header>, ErrorKind> {
        if self.parser.get_slice(self.parser.position, 2) == Some(b"\r\n") {
            self.parser.position += 2;
            return Ok(None);
        }

        if self.request.headers.headers.len() >= self.req_limits.max_headers {
            return Err(ErrorKind::TooManyHeaders);
        }

        let name_start = self.parser.position;
        let name_budget = self
            .parser
            .len
            .saturating_sub(name_start)
            .min(self.req_limits.max_header_name_length + 1);
        let name_slice = self
            .parser
            .get_slice(name_start, name_budget)
            .ok_or(ErrorKind::Incomplete)?;

        let colon_rel = memchr(b':', name_slice).ok_or_else(|| {
            if name_slice.len() > self.req_limits.max_header_name_length {
                ErrorKind::HeaderTooLong
            } else {
                ErrorKind::Incomplete
            }
        })?;

        if colon_rel == 0 {
            return Err(ErrorKind::MalformedHeader);
        }

        let name = {
            let name_mut = self
                .parser
                .get_slice_mut(name_start, colon_rel)
                .ok_or(ErrorKind::MalformedHeader)?;
            types::to_lower_case(name_mut);
            unsafe { Parser::into_static(name_mut) }
        };

        let mut value_start = name_start + colon_rel + 1;
        loop {
            match self.parser.get_slice(value_start, 1) {
                Some(b" ") | Some(b"\t") => value_start += 1,
                _ => break,
            }
        }

        let (value_end, value_len) = self.parse_header_value(value_start)?;
        let value = self
            .parser
            .get_slice_static(value_start, value_len)
            .ok_or(ErrorKind::MalformedHeader)?;

        self.parser.position = value_end;

        Ok(Some(Header::new(name, value)))
    }

    /// §4.4 steps 4-5: value-phase scan with obs-fold collapsing.
    ///
    /// Folds each `CRLF SP|HTAB-run` inside the value into a single `SP`,
    /// compacting the buffer in place so the returned value stays a
    /// contiguous zero-copy slice. Never commits on a bare trailing `LF`
    /// without one more lookahead byte.
    #[inline]
    fn parse_header_value(&mut self, value_start: usize) -> Result<(usize, usize), ErrorKind> {
        let mut read_cursor = value_start;
        let mut write_cursor = value_start;
        let mut total = 0usize;

        loop {
            let remaining = self.parser.len.saturating_sub(read_cursor);
            let window = self
                .parser
                .get_slice(read_cursor, remaining)
                .ok_or(ErrorKind::Incomplete)?;
            let cr_rel = memchr(b'\r', window).ok_or_else(|| {
                if total + window.len() > self.req_limits.max_header_value_length {
                    ErrorKind::HeaderTooLong
                } else {
                    ErrorKind::Incomplete
                }
            })?;

            // Everything up to the CR we just found has definitely arrived;
            // shifting it now (to collapse an earlier fold) is never undone
            // by a later `Incomplete` in this same call, since nothing past
            // `write_cursor` has been touched yet.
            if write_cursor != read_cursor {
                self.parser
                    .buffer
                    .copy_within(read_cursor..read_cursor + cr_rel, write_cursor);
            }
            total += cr_rel;
            write_cursor += cr_rel;

            let after_cr = read_cursor + cr_rel + 1;
            match self.parser.get_slice(after_cr, 1) {
                Some(b"\n") => {}
                Some(_) => return Err(ErrorKind::MalformedHeader),
                None => return Err(ErrorKind::Incomplete),
            }
            let after_lf = after_cr + 1;

            // §9: a bare trailing LF at the end of the buffered bytes is
            // ambiguous between obs-fold continuation and end-of-value -
            // never decide without the next byte.
            match self.parser.get_slice(after_lf, 1) {
                Some(b" ") | Some(b"\t") => {
                    let ws_window = self
                        .parser
                        .get_slice(after_lf, self.parser.len.saturating_sub(after_lf))
                        .ok_or(ErrorKind::Incomplete)?;
                    let ws_len = ws_window.iter().take_while(|&&b| b == b' ' || b == b'\t').count();

                    self.parser.buffer[write_cursor] = b' ';
                    write_cursor += 1;
                    total += 1;

                    if total > self.req_limits.max_header_value_length {
                        return Err(ErrorKind::HeaderTooLong);
                    }

                    read_cursor = after_lf + ws_len;
                }
                Some(_) => {
                    let mut end = write_cursor;
                    while end > value_start && matches!(self.parser.buffer[end - 1], b' ' | b'\t') {
                        end -= 1;
                    }
                    if total > self.req_limits.max_header_value_length {
                        return Err(ErrorKind::HeaderTooLong);
                    }
                    return Ok((after_lf, end - value_start));
                }
                None => return Err(ErrorKind::Incomplete),
            }
        }
    }

    #[inline]
    fn parse_special_header(&mut self, header: &Header) -> Result<bool, ErrorKind> {
        match header.name {
            b"content-length" => self.parse_content_length(header.value),
            b"connection" => self.parse_connection(header.value),
            _ => return Ok(false),
        }
        .map(|_| true)
    }

    #[inline]
    fn parse_content_length(&mut self, value: &[u8]) -> Result<(), ErrorKind> {
        let len = types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
        if len > self.req_limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }
        self.request.headers.content_length = Some(len);
        Ok(())
    }

    #[inline]
    fn parse_connection(&mut self, value: &[u8]) -> Result<(), ErrorKind> {
        let mut normalized = [0; 10];
        let len = types::into_lower_case(value, &mut normalized);

        match &normalized[..len] {
            b"keep-alive" => self.response.keep_alive = true,
            b"close" => self.response.keep_alive = false,
            _ => return Err(ErrorKind::InvalidConnection),
        }

        Ok(())
    }
}

// Parse body
impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn check_body(&mut self) -> Result<(), ErrorKind> {
        let parser = &self.parser;
        let body = parser.len - parser.position;

        match self.request.headers.content_length {
            Some(len) if len == body => {
                let slice = parser.get_slice_static(parser.position, len).ok_or(
                    ErrorKind::BodyMismatch {
                        expected: len,
                        available: body,
                    },
                )?;

                self.request.body = Some(slice);
                // Consume the body bytes so the next keep-alive iteration's
                // `carry_residual` doesn't re-offer them as leading garbage
                // in front of the following request.
                self.parser.position += len;
                Ok(())
            }
            Some(len) => Err(ErrorKind::BodyMismatch {
                expected: len,
                available: body,
            }),
            None => match body == 0 {
                true => Ok(()),
                false => Err(ErrorKind::UnexpectedBody(body)),
            },
        }
    }
}

//

/// How far `parse()` has gotten into the current request, so that an
/// `Incomplete` retry resumes at the step that ran out of data instead of
/// re-running already-completed steps against bytes they no longer own
/// (e.g. re-running `parse_method` over what is now the URL once the method
/// itself already succeeded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ParseStage {
    Preamble,
    Method,
    Url,
    Version,
    Headers,
    Body,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
#[repr(align(64))]
pub(crate) struct Parser {
    pub(crate) position: usize,
    pub(crate) len: usize,
    pub(crate) stage: ParseStage,
    pub(crate) buffer: Box<[u8]>,
}

impl Parser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        let buffer = vec![0; limits.precalc.buffer].into_boxed_slice();

        Parser {
            position: 0,
            len: 0,
            stage: ParseStage::Preamble,
            buffer,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let mut buffer = vec![0; limits.precalc.buffer];

        let value = value.as_ref();
        buffer[0..value.len()].copy_from_slice(value);

        Parser {
            position: 0,
            len: value.len(),
            stage: ParseStage::Preamble,
            buffer: buffer.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.position = 0;
        self.len = 0;
        self.stage = ParseStage::Preamble;
        self.buffer.fill(0);
    }

    /// Shifts unread bytes (the residual buffer) to the front, keeping them
    /// for the next keep-alive request instead of discarding them.
    #[inline]
    pub(crate) fn carry_residual(&mut self) {
        let residual = self.len - self.position;
        if residual > 0 && self.position > 0 {
            self.buffer.copy_within(self.position..self.len, 0);
        }
        self.len = residual;
        self.position = 0;
        self.stage = ParseStage::Preamble;
    }
}

// Work with Buffer
impl Parser {
    /// §4.1: `recv(until)`. `until = None` waits indefinitely; otherwise a
    /// read that cannot complete by the absolute deadline fails with a
    /// timeout. New bytes are appended after whatever residual bytes are
    /// already buffered.
    #[inline]
    pub(crate) async fn fill_buffer(
        &mut self,
        stream: &mut TcpStream,
        until: Option<Instant>,
    ) -> Result<usize, io::Error> {
        let read = stream.read(&mut self.buffer[self.len..]);

        let n = match until {
            None => read.await?,
            Some(deadline) => {
                if deadline <= Instant::now() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"));
                }
                tokio::select! {
                    biased;

                    result = read => result?,
                    _ = sleep_until(deadline) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"));
                    },
                }
            }
        };

        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
        }

        self.len += n;
        Ok(n)
    }

    // Low level
    //
    // Bounded by `self.len`, not just the buffer's physical capacity: bytes
    // past `len` are either uninitialized or stale leftovers from a prior
    // request's `carry_residual` shift, never data this connection has
    // actually received for the request being parsed.
    #[inline(always)]
    fn get_slice(&self, start: usize, step: usize) -> Option<&[u8]> {
        let end = start.checked_add(step)?;
        if end > self.len {
            return None;
        }
        self.buffer.get(start..end)
    }

    #[inline(always)]
    fn get_slice_mut(&mut self, start: usize, step: usize) -> Option<&mut [u8]> {
        let end = start.checked_add(step)?;
        if end > self.len {
            return None;
        }
        self.buffer.get_mut(start..end)
    }

    // Unsafe level
    #[inline(always)]
    fn get_slice_static(&self, start: usize, step: usize) -> Option<&'static [u8]> {
        let value = self.get_slice(start, step)?;
        unsafe { Some(Self::into_static(value)) }
    }

    #[inline(always)]
    // SAFETY: into_static creates "temporary" references for tokio integration,
    // which become invalid after Request cleanup.
    // Parser: 'static (lives for entire program lifetime), buffer cleared via .fill(0).
    // Memory remains valid even if user holds references.
    // DO NOT SUGGEST FIXES without full server architecture context.
    const unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        unsafe { mem::transmute(src) }
    }
}

#[cfg(test)]
mod request_self {
    use super::*;
    use crate::{server::connection::HttpConnection, tools::*};

    #[test]
    fn reset() {
        let limits = ReqLimits::default();
        let mut t =
            HttpConnection::from_req("OPTIONS /qwe&q=1 HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");

        assert_eq!(t.parse(false), Ok(Version::Http11));
        t.request.reset();
        assert_eq!(Request::new(&limits), t.request);
    }

    #[test]
    fn parse_method() {
        #[rustfmt::skip]
        let cases = [
            ("GET /url",    Some(&b"GET"[..])),
            ("PUT ",        Some(&b"PUT"[..])),
            ("PURGE /url ", Some(&b"PURGE"[..])),

            ("GET",        None),
            (" GET /",     None),
        ];

        for (input, expected) in cases {
            let mut t = HttpConnection::from_req(input);

            match expected {
                Some(method) => {
                    assert_eq!(t.parse_method(), Ok(()));
                    assert_eq!(t.request.method().as_bytes(), method);
                }
                None => assert!(t.parse_method().is_err()),
            }
        }
    }

    #[test]
    fn parse_url_basic() {
        #[rustfmt::skip]
        let cases = [
            ("/ ",                    "/", vec![]),
            ("/api/user ",            "/api/user", vec!["api", "user"]),
            ("///api//user ",         "///api//user", vec!["api", "user"]),
            ("/api/find?user=qwe ",   "/api/find", vec!["api", "find"]),
        ];

        for (input, path, parts) in cases {
            let mut t = HttpConnection::from_req(input);
            assert_eq!(t.parse_url(), Ok(()));
            assert_eq!(str_op(t.request.url().path()), path);
            assert_eq!(t.request.url().path_segments().len(), parts.len());
        }
    }

    #[test]
    fn parse_url_asterisk() {
        let mut t = HttpConnection::from_req("* HTTP/1.1\r\n\r\n");
        assert_eq!(t.parse_url(), Ok(()));
        assert_eq!(str_op(t.request.url().target()), "*");
    }

    #[test]
    fn parse_url_absolute_form() {
        let mut t = HttpConnection::from_req("http://example.com/path ");
        assert_eq!(t.parse_url(), Ok(()));
        assert_eq!(str_op(t.request.url().path()), "/path");
    }

    #[test]
    fn check_version() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.1\r\n",   Ok(Version::Http11)),
            ("HTTP/1.0\r\n",   Ok(Version::Http10)),
            ("HTTP/2.0\r\n",   Err(ErrorKind::UnsupportedVersion)),
            ("HTTP/1.1\n",     Err(ErrorKind::Incomplete)),
            ("HTTP/1.1\n despite", Err(ErrorKind::UnsupportedVersion)),
            ("http/1.1\r\n",   Err(ErrorKind::UnsupportedVersion)),
        ];

        for (value, expected) in cases {
            let mut t = HttpConnection::from_req(value);

            match expected {
                Ok(version) => {
                    assert_eq!(t.check_version(), Ok(()));
                    assert_eq!(t.request.version, version);
                    assert_eq!(t.response.keep_alive, version == Version::Http11);
                }
                Err(e) => assert_eq!(t.check_version(), Err(e)),
            }
        }
    }

    #[test]
    fn parse_headers_basic() {
        let mut t = HttpConnection::from_req("Header: value\r\nQwE: other\r\n\r\n");
        assert_eq!(t.parse_headers(), Ok(()));
        assert_eq!(str(t.request.header(b"header")), Some("value"));
        assert_eq!(str(t.request.header(b"qwe")), Some("other"));
    }

    #[test]
    fn parse_headers_obs_fold() {
        let mut t = HttpConnection::from_req("X-Long: a\r\n b\r\n\r\n");
        assert_eq!(t.parse_headers(), Ok(()));
        assert_eq!(str(t.request.header(b"x-long")), Some("a b"));
    }

    #[test]
    fn parse_headers_trailing_ws_trimmed() {
        let mut t = HttpConnection::from_req("Header: value  \r\n\r\n");
        assert_eq!(t.parse_headers(), Ok(()));
        assert_eq!(str(t.request.header(b"header")), Some("value"));
    }

    #[test]
    fn parse_headers_invalid() {
        #[rustfmt::skip]
        let cases = [
            "No-Colon value\r\n\r\n",
            ": empty-name\r\n\r\n",
            "Header: value\n\n",
        ];

        for input in cases {
            let mut t = HttpConnection::from_req(input);
            assert!(t.parse_headers().is_err());
        }
    }

    #[test]
    fn parse_special_header() {
        #[rustfmt::skip]
        let cases = [
            ("content-length: 1256\r\n\r\n", Ok((Some(1256), None))),
            ("connection: keep-alive\r\n\r\n", Ok((None, Some(true)))),
            ("connection: close\r\n\r\n", Ok((None, Some(false)))),
            ("connection: qwerrew\r\n\r\n", Err(ErrorKind::InvalidConnection)),
            ("content-length: 12asd\r\n\r\n", Err(ErrorKind::InvalidContentLength)),
            ("content-length: 4097\r\n\r\n", Err(ErrorKind::BodyTooLarge)),
        ];

        for (headers, result) in cases {
            let mut t = HttpConnection::from_req(headers);

            match result {
                Ok((content_length, keep_alive)) => {
                    assert_eq!(t.parse_headers(), Ok(()));
                    assert!(t.request.headers.headers.is_empty());

                    if let Some(len) = content_length {
                        assert_eq!(t.request.headers.content_length, Some(len));
                    }
                    if let Some(keep_alive) = keep_alive {
                        assert_eq!(t.response.keep_alive, keep_alive);
                    }
                }
                Err(e) => assert_eq!(t.parse_headers(), Err(e)),
            }
        }
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases: Vec<(&str, Result<(&[u8], &str, Version, Option<&[u8]>, bool), ErrorKind>)> = vec![
            (
                "GET / HTTP/1.1\r\nHost: a\r\n\r\n",
                Ok((b"GET", "/", Version::Http11, None, true)),
            ),
            (
                "POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody",
                Ok((b"POST", "/upload", Version::Http11, Some(b"body"), true)),
            ),
            (
                "DELETE / HTTP/1.0\r\nHost: a\r\nConnection: close\r\n\r\n",
                Ok((b"DELETE", "/", Version::Http10, None, false)),
            ),
            (
                "PURGE /cache HTTP/1.1\r\nHost: a\r\n\r\n",
                Ok((b"PURGE", "/cache", Version::Http11, None, true)),
            ),
        ];

        for (req, expected) in cases {
            let mut t = HttpConnection::from_req(req);

            match expected {
                Ok((method, path, version, body, keep_alive)) => {
                    assert_eq!(t.parse(false), Ok(version));
                    assert_eq!(t.request.method().as_bytes(), method);
                    assert_eq!(str_op(t.request.url().path()), path);
                    assert_eq!(t.request.body(), body);
                    assert_eq!(t.response.keep_alive, keep_alive);
                }
                Err(e) => assert_eq!(t.parse(false), Err(e)),
            }
        }
    }

    #[test]
    fn too_many_empty_lines() {
        let limits = ReqLimits::default();
        let preamble = "\r\n".repeat(limits.max_empty_lines + 1);
        let mut t = HttpConnection::from_req(format!("{preamble}GET / HTTP/1.1\r\nHost: a\r\n\r\n"));

        assert_eq!(t.parse(false), Err(ErrorKind::TooManyEmptyLines));
    }

    #[test]
    fn leading_bare_lf_is_malformed() {
        let mut t = HttpConnection::from_req("\nGET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(t.parse(false), Err(ErrorKind::MalformedRequestLine));
    }

    #[test]
    fn missing_host_on_http11() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.1\r\n\r\n");
        assert_eq!(t.parse(false), Err(ErrorKind::MissingHostOn11));
    }

    #[test]
    fn missing_host_on_http10_defaults() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.0\r\n\r\n");
        assert_eq!(t.parse(false), Ok(Version::Http10));
        assert_eq!(t.request.host(), b"");
        assert_eq!(t.request.port(), 80);
    }
}

#[cfg(test)]
mod parser {
    use super::*;
    use crate::tools::*;

    #[test]
    fn reset() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::new(&limits);

        parser.position = 5;
        parser.len = 10;
        parser.buffer[0] = b'X';

        parser.reset();

        assert_eq!(Parser::new(&limits), parser);
    }

    #[test]
    fn carry_residual() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::from(&limits, b"GET / HTTP/1.1\r\n\r\nEXTRA");

        parser.position = parser.len - 5;
        parser.carry_residual();

        assert_eq!(parser.len, 5);
        assert_eq!(parser.position, 0);
        assert_eq!(str(parser.get_slice(0, 5)), Some("EXTRA"));
    }

    #[test]
    fn get_slice() {
        let limits = ReqLimits::default().precalculate();
        let parser = Parser::from(&limits, b"test data here");

        assert_eq!(str(parser.get_slice(0, 4)), Some("test"));
        assert_eq!(str(parser.get_slice(5, 4)), Some("data"));
        assert_eq!(parser.get_slice(limits.precalc.buffer + 1, 10), None);
    }

    #[test]
    fn get_slice_mut() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::from(&limits, b"original");

        {
            let slice = parser.get_slice_mut(0, 8).unwrap();
            slice.copy_from_slice(b"modified");
        }

        assert_eq!(parser.get_slice(0, 8), Some(b"modified".as_ref()));
    }

    #[test]
    fn into_static() {
        let vec = vec![1, 2, 3];
        let vec_mut = vec.clone();

        let vec_static = unsafe { Parser::into_static(&vec_mut) };
        assert_eq!(vec_mut, vec_static);
    }
}
