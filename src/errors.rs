use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Ingestion error: {message}")]
    Ingestion { message: String },

    #[error("Detector error: {message}")]
    Detector { message: String },

    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl SentinelError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn ingestion(message: impl Into<String>) -> Self {
        Self::Ingestion { message: message.into() }
    }

    pub fn detector(message: impl Into<String>) -> Self {
        Self::Detector { message: message.into() }
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }

    /// HTTP status an API handler should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Lifecycle { .. } => 409,
            Self::Detector { .. } | Self::Http { .. } => 502,
            _ => 500,
        }
    }

    /// Errors a queued action can not recover from by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
