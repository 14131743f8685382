//! Request finalizer: resolves the effective host/port pair from the
//! `Host` header (or the transport default, for HTTP/1.0 requests that
//! omit it).

use crate::{
    errors::ErrorKind,
    http::types,
    server::connection::HttpConnection,
    ConnectionData, Handler, Version,
};
use memchr::memchr;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// §4.5: resolve `request.host`/`request.port`.
    ///
    /// A missing `Host` header is `MissingHostOn11` on HTTP/1.1; on
    /// HTTP/1.0 it defaults to an empty host and the transport's scheme
    /// default port.
    #[inline]
    pub(crate) fn finalize_host_port(&mut self, tls: bool) -> Result<(), ErrorKind> {
        let default_port = if tls { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT };

        let raw = match self.host_header_static() {
            Some(value) => value,
            None => {
                if self.request.version == Version::Http11 {
                    return Err(ErrorKind::MissingHostOn11);
                }
                self.request.host = b"";
                self.request.port = default_port;
                return Ok(());
            }
        };

        let (host, port_bytes) = split_host_port(raw)?;

        self.request.port = match port_bytes {
            Some(bytes) if !bytes.is_empty() => {
                let port = types::slice_to_usize(bytes).ok_or(ErrorKind::MalformedHost)?;
                u16::try_from(port).map_err(|_| ErrorKind::MalformedHost)?
            }
            Some(_) => return Err(ErrorKind::MalformedHost),
            None => default_port,
        };
        self.request.host = lower_in_place(host);

        Ok(())
    }

    #[inline]
    fn host_header_static(&self) -> Option<&'static [u8]> {
        self.request
            .headers
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(b"host"))
            .map(|h| h.value)
    }
}

/// Splits a `Host` header value into `(host, Some(port_bytes))`, handling
/// the bracketed IPv6-literal form (`[::1]:8080`).
#[inline]
fn split_host_port(value: &'static [u8]) -> Result<(&'static [u8], Option<&'static [u8]>), ErrorKind> {
    if value.first() == Some(&b'[') {
        let close = memchr(b']', value).ok_or(ErrorKind::MalformedHost)?;
        let host = &value[1..close];

        return match value.get(close + 1) {
            None => Ok((host, None)),
            Some(b':') => Ok((host, Some(&value[close + 2..]))),
            Some(_) => Err(ErrorKind::MalformedHost),
        };
    }

    match memchr(b':', value) {
        Some(sep) => Ok((&value[..sep], Some(&value[sep + 1..]))),
        None => Ok((value, None)),
    }
}

/// Lower-cases `src` in place and hands the same slice back.
///
/// SAFETY: `src` is a `'static` slice of this connection's own parse
/// buffer, mirroring [`super::request::Parser::into_static`]'s invariant:
/// the connection owns the buffer exclusively and no other reference to
/// these bytes escapes it, so writing through a reinterpreted mutable
/// slice cannot race or alias.
#[inline]
fn lower_in_place(src: &'static [u8]) -> &'static [u8] {
    let mutable = unsafe { std::slice::from_raw_parts_mut(src.as_ptr() as *mut u8, src.len()) };
    types::to_lower_case(mutable);
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{server::connection::HttpConnection, tools::*};

    #[test]
    fn host_only() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.1\r\nHost: Example.com\r\n\r\n");
        assert_eq!(t.parse(false), Ok(Version::Http11));
        assert_eq!(str(Some(t.request.host())), Some("example.com"));
        assert_eq!(t.request.port(), 80);
    }

    #[test]
    fn host_with_port() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
        assert_eq!(t.parse(true), Ok(Version::Http11));
        assert_eq!(str(Some(t.request.host())), Some("example.com"));
        assert_eq!(t.request.port(), 8443);
    }

    #[test]
    fn host_ipv6_bracket() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.1\r\nHost: [::1]:9000\r\n\r\n");
        assert_eq!(t.parse(false), Ok(Version::Http11));
        assert_eq!(str(Some(t.request.host())), Some("::1"));
        assert_eq!(t.request.port(), 9000);
    }

    #[test]
    fn host_malformed_port() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.1\r\nHost: example.com:abc\r\n\r\n");
        assert_eq!(t.parse(false), Err(ErrorKind::MalformedHost));
    }

    #[test]
    fn tls_default_port() {
        let mut t = HttpConnection::from_req("GET / HTTP/1.0\r\n\r\n");
        assert_eq!(t.parse(true), Ok(Version::Http10));
        assert_eq!(t.request.port(), 443);
    }
}
