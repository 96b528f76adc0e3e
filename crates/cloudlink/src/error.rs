use std::borrow::Cow;

/// All error kinds which might be raised by the connection core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A scope identifier or model identifier is missing or malformed.
    Configuration,
    /// The network readiness probe has failed.
    Network,
    /// The registration against the provisioning service has failed.
    Provisioning,
    /// The hub session could not be opened.
    Session,
    /// An operation requires an open hub session.
    NotInitialized,
    /// An argument passed to an operation is invalid.
    InvalidArgument,
    /// The transport outbound queue is full.
    QueueFull,
    /// The underlying transport has reported an error.
    Transport,
    /// A JSON document could not be parsed or serialized.
    Json,
    /// An input/output error.
    Io,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Configuration => "Configuration",
            Self::Network => "Network",
            Self::Provisioning => "Provisioning",
            Self::Session => "Session",
            Self::NotInitialized => "Not Initialized",
            Self::InvalidArgument => "Invalid Argument",
            Self::QueueFull => "Queue Full",
            Self::Transport => "Transport",
            Self::Json => "Json",
            Self::Io => "Input/Output",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A connection core error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    info: Cow<'static, str>,
}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    pub fn new(kind: ErrorKind, info: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            info: info.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn info(&self) -> &str {
        &self.info
    }

    pub(crate) fn configuration(info: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Configuration, info)
    }

    pub(crate) fn not_initialized(info: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotInitialized, info)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.info)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Json, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
