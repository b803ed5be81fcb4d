use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the runtime.
///
/// Protocol failures observed inside the poll loop are not returned
/// through this type; they are delivered to the connection's handler as
/// an `Event::Error` followed by a drain. This enum covers the API
/// surface: operations the caller invokes directly.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Malformed HTTP, WebSocket or MQTT data.
    Parse(String),
    /// Buffer growth rejected by the allocator.
    Resource(String),
    /// Operation refused: wrong connection kind or state.
    Usage(&'static str),
    /// Endpoint URL could not be parsed.
    Url(String),
    /// `wakeup` requires `ManagerConfig::enable_wakeup(true)`.
    WakeupDisabled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Resource(msg) => write!(f, "resource error: {}", msg),
            Error::Usage(msg) => write!(f, "usage error: {}", msg),
            Error::Url(msg) => write!(f, "bad url: {}", msg),
            Error::WakeupDisabled => write!(f, "wakeup channel not enabled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_covers_variants() {
        let io = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(io.to_string().contains("boom"));
        assert!(Error::Parse("bad chunk".into()).to_string().contains("bad chunk"));
        assert!(Error::Usage("not a listener").to_string().contains("not a listener"));
        assert_eq!(
            Error::WakeupDisabled.to_string(),
            "wakeup channel not enabled"
        );
    }

    #[test]
    fn test_io_source_preserved() {
        use std::error::Error as _;
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(err.source().is_some());
        assert!(Error::Url("x".into()).source().is_none());
    }
}
