use thiserror::Error;

/// Failures reported by the platform API seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("transient api failure: {0}")]
    Transient(String),
    #[error("user or room not found: {0}")]
    NotFound(String),
    #[error("blacklisted or geo-blocked: {0}")]
    Blacklisted(String),
    #[error("login required: {0}")]
    LoginRequired(String),
    #[error("age restricted: {0}")]
    AgeRestricted(String),
    #[error("connection closed by the server: {0}")]
    ConnectionClosed(String),
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::Transient(_) => ApiErrorKind::Transient,
            Self::NotFound(_) => ApiErrorKind::NotFound,
            Self::Blacklisted(_) => ApiErrorKind::Blacklisted,
            Self::LoginRequired(_) => ApiErrorKind::LoginRequired,
            Self::AgeRestricted(_) => ApiErrorKind::AgeRestricted,
            Self::ConnectionClosed(_) => ApiErrorKind::ConnectionClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Transient,
    NotFound,
    Blacklisted,
    LoginRequired,
    AgeRestricted,
    ConnectionClosed,
}

impl ApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Blacklisted => "blacklisted",
            Self::LoginRequired => "login_required",
            Self::AgeRestricted => "age_restricted",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum LiverecError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("recording program not found: {0}")]
    ProcessMissing(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("illegal session transition: {0}")]
    InvalidTransition(String),
}
