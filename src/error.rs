use std::fmt;
use std::io;
use std::sync::Arc;

/// The kinds of failure the parser can report, per the multipart wire format
/// and the caller-supplied limits.
#[derive(Debug)]
pub enum ErrorKind {
    /// `Content-Type` was missing or was not `multipart/*`.
    NotMultipart,
    /// No `boundary=` parameter was found in the `Content-Type` value.
    MissingBoundary,
    /// The boundary value contained a byte outside of 7-bit ASCII.
    BoundaryNon7Bit,
    /// The boundary value was longer than 70 characters.
    BoundaryTooLong,
    /// The `boundary=` parameter was present but its value was empty.
    BoundaryEmpty,
    /// The input ended where the parser expected more bytes.
    UnexpectedEof,
    /// A header line did not match the header grammar.
    MalformedHeaders,
    /// Trailing bytes after a boundary ran past the scratch buffer before a
    /// CRLF was found.
    BoundaryLineTooLong,
    /// A part body, the preamble, the epilogue, or a part's `Content-Length`
    /// exceeded its configured cap.
    LimitExceeded,
    /// The consumer released a part before its headers were delivered, or
    /// the stream was cancelled.
    Cancelled,
    /// A failure reported by the underlying byte stream.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::NotMultipart => write!(f, "Content-Type is not multipart/*"),
            ErrorKind::MissingBoundary => write!(f, "no boundary parameter in Content-Type"),
            ErrorKind::BoundaryNon7Bit => write!(f, "boundary value contains a non-7-bit byte"),
            ErrorKind::BoundaryTooLong => write!(f, "boundary value longer than 70 characters"),
            ErrorKind::BoundaryEmpty => write!(f, "boundary value is empty"),
            ErrorKind::UnexpectedEof => write!(f, "input ended before the parser expected"),
            ErrorKind::MalformedHeaders => write!(f, "a part header line was malformed"),
            ErrorKind::BoundaryLineTooLong => {
                write!(f, "boundary line trailer exceeded its buffer")
            }
            ErrorKind::LimitExceeded => write!(f, "a configured size limit was exceeded"),
            ErrorKind::Cancelled => write!(f, "the part or stream was cancelled"),
            ErrorKind::Io => write!(f, "underlying byte stream failed"),
        }
    }
}

struct Repr {
    kind: ErrorKind,
    source: Option<io::Error>,
}

/// The error type returned throughout this crate.
///
/// Cheaply cloneable: a single failure mid-part must be delivered to three
/// places at once (the pending headers future, the open body substream, and
/// the top-level event stream), so the representation is reference counted
/// rather than owned per site.
#[derive(Clone)]
pub struct Error(Arc<Repr>);

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Error(Arc::new(Repr { kind, source: None }))
    }

    pub(crate) fn io(err: io::Error) -> Self {
        Error(Arc::new(Repr {
            kind: ErrorKind::Io,
            source: Some(err),
        }))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.0.kind)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

pub(crate) fn err(kind: ErrorKind) -> Error {
    Error::new(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_kind() {
        let e = Error::new(ErrorKind::MissingBoundary);
        assert_eq!(e.to_string(), "no boundary parameter in Content-Type");
    }

    #[test]
    fn clone_is_cheap_and_shares_kind() {
        let e = Error::new(ErrorKind::Cancelled);
        let c = e.clone();
        assert!(matches!(c.kind(), ErrorKind::Cancelled));
    }

    #[test]
    fn io_error_is_the_source() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let e: Error = io_err.into();
        assert!(matches!(e.kind(), ErrorKind::Io));
        assert!(std::error::Error::source(&e).is_some());
    }
}
