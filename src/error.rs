use std::io;
use thiserror::Error;

/// Unified error type for the tunnel control and data planes
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Token, version or user rejection during login
    #[error("authorization failed: {0}")]
    Auth(String),

    /// No allowed port matched the request
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// A proxy with the same name is already registered
    #[error("proxy name [{0}] is already in use")]
    NameCollision(String),

    /// A vhost route for the same (domain, location) already exists
    #[error("vhost route [{domain}{location}] is already registered")]
    VhostConflict { domain: String, location: String },

    /// Group key differs from the one the group was created with
    #[error("group key for group [{0}] does not match")]
    GroupAuth(String),

    /// Framed message codec failure; closes the transport
    #[error("codec error: {0}")]
    Codec(String),

    /// Peer missed a read or heartbeat deadline
    #[error("peer timeout: {0}")]
    PeerTimeout(String),

    /// No work connection arrived within the wait window
    #[error("work connection pool exhausted for proxy [{0}]")]
    PoolExhausted(String),

    /// NAT hole punching did not complete in time
    #[error("nat hole punching timeout: {0}")]
    NatHoleTimeout(String),

    /// The client could not reach the configured local service
    #[error("local service unreachable: {0}")]
    LocalServiceUnreachable(String),

    /// An in-process plugin failed to handle the connection
    #[error("plugin error: {0}")]
    Plugin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that must tear down the whole control transport, as opposed
    /// to errors that only fail one proxy registration or one connection.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Codec(_) | Error::PeerTimeout(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "early eof");
        let err: Error = io_err.into();
        let display = format!("{}", err);
        assert!(display.contains("IO error"));
        assert!(display.contains("early eof"));
    }

    #[test]
    fn test_vhost_conflict_display() {
        let err = Error::VhostConflict {
            domain: "api.example.com".to_string(),
            location: "/v2".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "vhost route [api.example.com/v2] is already registered"
        );
    }

    #[test]
    fn test_name_collision_display() {
        let err = Error::NameCollision("ssh".to_string());
        assert!(format!("{}", err).contains("[ssh]"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Auth("bad token".into()).is_fatal_for_session());
        assert!(Error::Codec("truncated".into()).is_fatal_for_session());
        assert!(!Error::NameCollision("web".into()).is_fatal_for_session());
        assert!(!Error::PortUnavailable("6000".into()).is_fatal_for_session());
    }
}
