use crate::{query, StatusCode, Version};
use std::{error, fmt, io};

/// Every way a connection can fail, protocol-level or transport-level.
///
/// Protocol violations ([`ErrorKind::status`] returns `Some`) get a single
/// synthesized response before the socket closes. Transport-level failures
/// and the abort paths named in the PROXY-protocol and peer-address rules
/// ([`ErrorKind::status`] returns `None`) close the socket silently.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    /// A scan ran out of currently-buffered bytes before finding its
    /// terminator, but has not yet hit any configured size limit. Never
    /// reaches a peer: the keep-alive loop catches it, reads more, and
    /// retries the same parse step (§4.1, §9 "obs-fold edge case").
    Incomplete,

    MalformedRequestLine,
    RequestLineTooLong,
    TooManyEmptyLines,
    UnsupportedVersion,

    MalformedHeader,
    TooManyHeaders,
    HeaderTooLong,

    MissingHostOn11,
    MalformedHost,

    ReadTimeoutDuringHeaders,

    InvalidContentLength,
    InvalidConnection,
    #[allow(dead_code)]
    Query(query::Error),

    BodyTooLarge,
    #[allow(dead_code)]
    BodyMismatch {
        expected: usize,
        available: usize,
    },
    #[allow(dead_code)]
    UnexpectedBody(usize),

    /// PROXY-protocol preamble present but neither a known address family
    /// nor `UNKNOWN`. Abort, no response.
    NotProxyProtocol,
    /// Peer address unavailable mid-request. Abort, no response.
    PeerGone,
    /// Transport reported closed/EOF. Abort, no response.
    TransportClosed,

    ServiceUnavailable,
    Io(IoError),
}

impl ErrorKind {
    /// The HTTP status this error synthesizes a response for, or `None` for
    /// the silent-close kinds (§7: `PeerGone` / `TransportClosed` /
    /// `NotProxyProtocol` never produce a response).
    pub(crate) const fn status(&self) -> Option<StatusCode> {
        match self {
            // Never actually reaches a caller that asks for a status: the
            // keep-alive loop intercepts it and retries. Mapped to 400 only
            // as a defensive fallback if that invariant is ever broken.
            Self::Incomplete
            | Self::MalformedRequestLine
            | Self::TooManyEmptyLines
            | Self::MalformedHeader
            | Self::TooManyHeaders
            | Self::HeaderTooLong
            | Self::MissingHostOn11
            | Self::MalformedHost
            | Self::InvalidContentLength
            | Self::InvalidConnection
            | Self::Query(_)
            | Self::BodyMismatch { .. }
            | Self::UnexpectedBody(_) => Some(StatusCode::BadRequest),
            Self::RequestLineTooLong => Some(StatusCode::UriTooLong),
            Self::UnsupportedVersion => Some(StatusCode::HttpVersionNotSupported),
            Self::ReadTimeoutDuringHeaders => Some(StatusCode::RequestTimeout),
            Self::BodyTooLarge => Some(StatusCode::PayloadTooLarge),
            Self::ServiceUnavailable | Self::Io(_) => Some(StatusCode::ServiceUnavailable),
            Self::NotProxyProtocol | Self::PeerGone | Self::TransportClosed => None,
        }
    }

    /// Whether this error closes the connection without ever writing a
    /// response, regardless of what [`ErrorKind::status`] would say.
    pub(crate) const fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::NotProxyProtocol | Self::PeerGone | Self::TransportClosed
        )
    }
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(&self, version: Version, json: bool) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* _ => "" }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        Incomplete: "400 Bad Request", "58"
            => r#"{"error":"Malformed request line","code":"MALFORMED_REQUEST_LINE"}"#;
        MalformedRequestLine: "400 Bad Request", "58"
            => r#"{"error":"Malformed request line","code":"MALFORMED_REQUEST_LINE"}"#;
        RequestLineTooLong: "414 URI Too Long", "56"
            => r#"{"error":"Request line too long","code":"REQUEST_LINE_TOO_LONG"}"#;
        TooManyEmptyLines: "400 Bad Request", "60"
            => r#"{"error":"Too many empty preamble lines","code":"TOO_MANY_EMPTY_LINES"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        MalformedHeader: "400 Bad Request", "52"
            => r#"{"error":"Malformed header line","code":"MALFORMED_HEADER"}"#;
        TooManyHeaders: "400 Bad Request", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeaderTooLong: "400 Bad Request", "50"
            => r#"{"error":"Header too long","code":"HEADER_TOO_LONG"}"#;

        MissingHostOn11: "400 Bad Request", "58"
            => r#"{"error":"Missing Host header on HTTP/1.1","code":"MISSING_HOST"}"#;
        MalformedHost: "400 Bad Request", "50"
            => r#"{"error":"Malformed Host header","code":"MALFORMED_HOST"}"#;

        ReadTimeoutDuringHeaders: "408 Request Timeout", "48"
            => r#"{"error":"Timed out reading headers","code":"READ_TIMEOUT"}"#;

        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        BodyMismatch: "400 Bad Request", "55"
            => r#"{"error":"Body length mismatch","code":"BODY_MISMATCH"}"#;
        UnexpectedBody: "400 Bad Request", "60"
            => r#"{"error":"Unexpected request body","code":"UNEXPECTED_BODY"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        if matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
        ) {
            return ErrorKind::TransportClosed;
        }
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
