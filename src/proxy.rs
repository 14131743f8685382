//! PROXY protocol v1 (human-readable) preamble decoder.
//!
//! Parses the single-line, space-separated preamble a load balancer or
//! reverse proxy prepends to a forwarded TCP connection, e.g.:
//!
//! ```text
//! PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n
//! PROXY UNKNOWN\r\n
//! ```
//!
//! Grounded in the `ppp` crate's own v1 grammar (address family token,
//! dotted-quad/colon-hex addresses, decimal ports) and implemented with
//! the same `memchr`-driven manual scanning the request-line parser uses,
//! rather than adopting `ppp`/`nom` as a dependency (see `DESIGN.md`).

use crate::errors::ErrorKind;
use memchr::memchr;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Longest legal v1 preamble line per the spec (`PROXY` + 5 fields + CRLF).
pub(crate) const MAX_PROXY_LINE: usize = 107;

/// The fixed prefix that marks a connection as opening with a PROXY
/// protocol v1 preamble rather than an HTTP request line.
const PREAMBLE_PREFIX: &[u8] = b"PROXY ";

/// Whether `buffer` has accumulated enough bytes to tell, and if so,
/// whether it opens with the PROXY protocol v1 preamble prefix (§4.2: the
/// decoder triggers purely on content, never on configuration).
pub(crate) fn has_preamble(buffer: &[u8]) -> Option<bool> {
    if buffer.len() < PREAMBLE_PREFIX.len() {
        return None;
    }
    Some(&buffer[..PREAMBLE_PREFIX.len()] == PREAMBLE_PREFIX)
}

/// Forwarded peer information extracted from a PROXY protocol v1 preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyInfo {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
    },
    /// `PROXY UNKNOWN` — proxied connection of unknown/unsupported family.
    /// The original peer address is deliberately not disclosed.
    Unknown,
}

impl ProxyInfo {
    /// The original client address, when known.
    pub const fn src_port(&self) -> Option<u16> {
        match self {
            Self::Ipv4 { src_port, .. } | Self::Ipv6 { src_port, .. } => Some(*src_port),
            Self::Unknown => None,
        }
    }
}

/// Parses one PROXY protocol v1 line (without the terminating `\r\n`).
///
/// `line` must already exclude the trailing `CRLF`. Anything after
/// `"PROXY "` that is not `TCP4`, `TCP6`, or `UNKNOWN` is
/// [`ErrorKind::NotProxyProtocol`] — a fatal, silent abort per policy.
pub(crate) fn parse_line(line: &[u8]) -> Result<ProxyInfo, ErrorKind> {
    let rest = line.strip_prefix(b"PROXY ").ok_or(ErrorKind::NotProxyProtocol)?;

    if rest == b"UNKNOWN" || rest.starts_with(b"UNKNOWN ") {
        return Ok(ProxyInfo::Unknown);
    }

    let mut fields = rest.split(|&b| b == b' ');
    let family = fields.next().ok_or(ErrorKind::NotProxyProtocol)?;
    let src = fields.next().ok_or(ErrorKind::NotProxyProtocol)?;
    let dst = fields.next().ok_or(ErrorKind::NotProxyProtocol)?;
    let src_port = fields.next().ok_or(ErrorKind::NotProxyProtocol)?;
    let dst_port = fields.next().ok_or(ErrorKind::NotProxyProtocol)?;

    let src_port = parse_port(src_port)?;
    let dst_port = parse_port(dst_port)?;

    match family {
        b"TCP4" => Ok(ProxyInfo::Ipv4 {
            src: parse_ascii(src)?,
            dst: parse_ascii(dst)?,
            src_port,
            dst_port,
        }),
        b"TCP6" => Ok(ProxyInfo::Ipv6 {
            src: parse_ascii(src)?,
            dst: parse_ascii(dst)?,
            src_port,
            dst_port,
        }),
        _ => Err(ErrorKind::NotProxyProtocol),
    }
}

/// Finds the end of the preamble line (the `CR` of its terminating `CRLF`)
/// within an already-filled buffer, enforcing [`MAX_PROXY_LINE`].
///
/// Returns [`ErrorKind::Incomplete`] when the buffered bytes have not yet
/// hit [`MAX_PROXY_LINE`] and simply don't contain a `CRLF` yet - the
/// caller should read more and retry. Only a window that has reached the
/// cap without finding one is a genuine [`ErrorKind::NotProxyProtocol`].
pub(crate) fn find_line_end(buffer: &[u8]) -> Result<usize, ErrorKind> {
    let capped = buffer.len() >= MAX_PROXY_LINE + 1;
    let scanned = buffer.len().min(MAX_PROXY_LINE + 1);
    let window = &buffer[..scanned];

    let cr = memchr(b'\r', window).ok_or(if capped {
        ErrorKind::NotProxyProtocol
    } else {
        ErrorKind::Incomplete
    })?;
    match window.get(cr + 1) {
        Some(&b'\n') => Ok(cr),
        Some(_) => Err(ErrorKind::NotProxyProtocol),
        None if capped => Err(ErrorKind::NotProxyProtocol),
        None => Err(ErrorKind::Incomplete),
    }
}

fn parse_port(bytes: &[u8]) -> Result<u16, ErrorKind> {
    if bytes.is_empty() || (bytes.len() > 1 && bytes[0] == b'0') {
        return Err(ErrorKind::NotProxyProtocol);
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ErrorKind::NotProxyProtocol)
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, ErrorKind> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ErrorKind::NotProxyProtocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp4() {
        let info = parse_line(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443").unwrap();
        assert_eq!(
            info,
            ProxyInfo::Ipv4 {
                src: "192.168.0.1".parse().unwrap(),
                dst: "192.168.0.11".parse().unwrap(),
                src_port: 56324,
                dst_port: 443,
            }
        );
    }

    #[test]
    fn tcp6() {
        let info = parse_line(b"PROXY TCP6 ::1 ::2 1 2").unwrap();
        assert_eq!(
            info,
            ProxyInfo::Ipv6 {
                src: "::1".parse().unwrap(),
                dst: "::2".parse().unwrap(),
                src_port: 1,
                dst_port: 2,
            }
        );
    }

    #[test]
    fn unknown() {
        assert_eq!(parse_line(b"PROXY UNKNOWN"), Ok(ProxyInfo::Unknown));
    }

    #[test]
    fn leading_zero_port_rejected() {
        assert_eq!(
            parse_line(b"PROXY TCP4 1.1.1.1 1.1.1.1 0123 443"),
            Err(ErrorKind::NotProxyProtocol)
        );
    }

    #[test]
    fn bad_prefix() {
        assert_eq!(
            parse_line(b"GET / HTTP/1.1"),
            Err(ErrorKind::NotProxyProtocol)
        );
    }

    #[test]
    fn bad_family() {
        assert_eq!(
            parse_line(b"PROXY SCTP 1.1.1.1 1.1.1.1 1 2"),
            Err(ErrorKind::NotProxyProtocol)
        );
    }

    #[test]
    fn find_line_end_basic() {
        assert_eq!(find_line_end(b"PROXY UNKNOWN\r\nGET"), Ok(13));
    }

    #[test]
    fn find_line_end_too_long() {
        let line = [b'A'; MAX_PROXY_LINE + 10];
        assert_eq!(find_line_end(&line), Err(ErrorKind::NotProxyProtocol));
    }

    #[test]
    fn has_preamble_detects_prefix() {
        assert_eq!(has_preamble(b"PROXY TCP4 1.2.3.4"), Some(true));
        assert_eq!(has_preamble(b"GET / HTTP/1.1\r\n"), Some(false));
        assert_eq!(has_preamble(b"PROX"), None);
    }
}
