pub mod api;
pub mod db;
pub mod env;
pub mod realtime;


use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use db::Database;
use realtime::{RealtimeClient, ReqwestRealtimeClient};
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc, time::Duration};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub enum Error {
    /// The referenced user, plan, subscription or prompt does not exist.
    NotFound(String),
    /// A deduction asked for more tokens than the user holds.
    InsufficientBalance { balance: i32, required: i32 },
    /// The user's plan does not allow another custom prompt.
    PromptLimitReached { current: usize, max: usize },
    InvalidArgument(String),
    /// Concurrent writers collided; nothing was committed and the caller may retry.
    TransactionConflict,
    /// The store could not be reached within the configured deadline.
    StoreUnavailable(String),
    Http(StatusCode, String, HeaderMap),
    Database(sea_orm::error::DbErr),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl From<sea_orm::error::DbErr> for Error {
    fn from(error: sea_orm::error::DbErr) -> Self {
        db::classify_db_error(error)
    }
}

impl From<axum::Error> for Error {
    fn from(error: axum::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<axum::http::Error> for Error {
    fn from(error: axum::http::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<realtime::RealtimeError> for Error {
    fn from(error: realtime::RealtimeError) -> Self {
        match error {
            realtime::RealtimeError::Timeout => {
                Self::http(StatusCode::GATEWAY_TIMEOUT, error.to_string())
            }
            realtime::RealtimeError::Status(_) | realtime::RealtimeError::Transport(_) => {
                Self::http(StatusCode::BAD_GATEWAY, error.to_string())
            }
        }
    }
}

impl Error {
    pub fn http(code: StatusCode, message: String) -> Self {
        Self::Http(code, message, HeaderMap::default())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::PromptLimitReached { .. } => StatusCode::FORBIDDEN,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::TransactionConflict => StatusCode::CONFLICT,
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Http(code, _, _) => *code,
            Error::Database(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();
        let body = |message: String| {
            Json(serde_json::json!({
                "success": false,
                "error": message,
            }))
        };
        match self {
            Error::Http(code, message, headers) => {
                log::error!("HTTP error {}: {}", code, &message);
                (code, headers, body(message)).into_response()
            }
            Error::Database(error) => {
                log::error!("HTTP error {}: {:?}", code, &error);
                (code, body(format!("{}", &error))).into_response()
            }
            Error::Internal(error) => {
                log::error!("HTTP error {}: {:?}", code, &error);
                (code, body(format!("{}", &error))).into_response()
            }
            Error::StoreUnavailable(_) | Error::TransactionConflict => {
                log::warn!("HTTP error {}: {}", code, &self);
                (code, body(self.to_string())).into_response()
            }
            error => (code, body(error.to_string())).into_response(),
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(code, message, _headers) => (code, message).fmt(f),
            Error::Database(error) => error.fmt(f),
            Error::Internal(error) => error.fmt(f),
            error => write!(f, "{error}"),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::InsufficientBalance { balance, required } => {
                write!(f, "insufficient tokens: have {balance}, need {required}")
            }
            Error::PromptLimitReached { current, max } => {
                write!(f, "prompt limit reached: {current}/{max}")
            }
            Error::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Error::TransactionConflict => write!(f, "transaction conflict, please retry"),
            Error::StoreUnavailable(message) => write!(f, "store unavailable: {message}"),
            Error::Http(code, message, _) => write!(f, "{code}: {message}"),
            Error::Database(error) => error.fmt(f),
            Error::Internal(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

fn default_database_max_connections() -> u32 {
    25
}

fn default_database_min_connections() -> u32 {
    5
}

fn default_database_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_database_query_timeout_ms() -> u64 {
    15_000
}

fn default_token_balance() -> i32 {
    1000
}

fn default_realtime_api_url() -> String {
    "https://api.openai.com/v1/realtime/client_secrets".into()
}

fn default_realtime_timeout_ms() -> u64 {
    20_000
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub http_port: u16,
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_database_min_connections")]
    pub database_min_connections: u32,
    #[serde(default = "default_database_acquire_timeout_ms")]
    pub database_acquire_timeout_ms: u64,
    #[serde(default = "default_database_query_timeout_ms")]
    pub database_query_timeout_ms: u64,
    pub migrations_path: Option<PathBuf>,
    pub api_token: String,
    pub environment: Arc<str>,
    #[serde(default)]
    pub allowed_origins: Option<String>,
    #[serde(default = "default_token_balance")]
    pub default_token_balance: i32,
    pub realtime_api_key: Option<Arc<str>>,
    #[serde(default = "default_realtime_api_url")]
    pub realtime_api_url: String,
    #[serde(default = "default_realtime_timeout_ms")]
    pub realtime_timeout_ms: u64,
    pub rust_log: Option<String>,
    pub log_json: Option<bool>,
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.environment == "development".into()
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.allowed_origins
            .as_deref()
            .unwrap_or("http://localhost:3000")
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.database_query_timeout_ms)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn test() -> Self {
        Self {
            http_port: 0,
            database_url: "".into(),
            database_max_connections: 1,
            database_min_connections: 1,
            database_acquire_timeout_ms: default_database_acquire_timeout_ms(),
            database_query_timeout_ms: default_database_query_timeout_ms(),
            migrations_path: None,
            api_token: "test-api-token".into(),
            environment: "test".into(),
            allowed_origins: None,
            default_token_balance: default_token_balance(),
            realtime_api_key: None,
            realtime_api_url: default_realtime_api_url(),
            realtime_timeout_ms: default_realtime_timeout_ms(),
            rust_log: None,
            log_json: None,
        }
    }
}

#[derive(Default, Deserialize)]
pub struct MigrateConfig {
    pub database_url: String,
    pub migrations_path: Option<PathBuf>,
}

pub struct AppState {
    pub db: Arc<Database>,
    pub realtime_client: Option<Arc<dyn RealtimeClient>>,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let mut db_options = db::ConnectOptions::new(config.database_url.clone());
        db_options
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_millis(config.database_acquire_timeout_ms));
        let db = Database::new(db_options, config.query_timeout()).await?;

        let realtime_client = config.realtime_api_key.as_ref().map(|api_key| {
            Arc::new(ReqwestRealtimeClient::new(
                config.realtime_api_url.clone(),
                api_key.clone(),
                Duration::from_millis(config.realtime_timeout_ms),
            )) as Arc<dyn RealtimeClient>
        });
        if realtime_client.is_none() {
            tracing::warn!("REALTIME_API_KEY is not set, realtime credentials are disabled");
        }

        Ok(Self::with_database(Arc::new(db), realtime_client, config))
    }

    /// Builds the state around an already connected database.
    pub fn with_database(
        db: Arc<Database>,
        realtime_client: Option<Arc<dyn RealtimeClient>>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            realtime_client,
            config,
        })
    }
}
