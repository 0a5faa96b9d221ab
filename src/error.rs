use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(String),
    /// 401/403 from an authenticated panel call.
    Unauthorized(String),
    Timeout(String),
    Connect(String),
    Json(String),
    Io(String),
    Panel(String),
    Subscription(String),
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Timeouts and refused connections are reported as-is, without
    /// touching the cached subscription URL.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Connect(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(msg) => write!(f, "http error: {msg}"),
            Error::Timeout(msg) => write!(f, "timed out: {msg}"),
            Error::Connect(msg) => write!(f, "connection error: {msg}"),
            Error::Json(msg) => write!(f, "invalid json: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Unauthorized(msg) => write!(f, "{msg}"),
            Error::Panel(msg) => write!(f, "{msg}"),
            Error::Subscription(msg) => write!(f, "{msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() {
            Error::Connect(err.to_string())
        } else {
            Error::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_flagged() {
        assert!(Error::Timeout("x".into()).is_transport());
        assert!(Error::Connect("x".into()).is_transport());
        assert!(!Error::Http("x".into()).is_transport());
        assert!(!Error::Unauthorized("x".into()).is_transport());
        assert!(Error::Unauthorized("x".into()).is_unauthorized());
    }

    #[test]
    fn panel_messages_display_verbatim() {
        assert_eq!(Error::Panel("boom".into()).to_string(), "boom");
        assert_eq!(
            Error::Config("bad".into()).to_string(),
            "config error: bad"
        );
    }
}
