use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub escrow: EscrowSection,
    pub game: GameSection,
    pub persistence: PersistenceSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    pub ops_http_bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowSection {
    pub rpc_urls: Vec<String>,
    pub module_address: String,
    pub chain_id: u64,
    pub verify_max_attempts: u32,
    pub verify_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSection {
    pub default_time_seconds: u64,
    pub reconnect_window_seconds: u64,
    pub draw_offer_ttl_seconds: u64,
    pub room_gc_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSection {
    pub usernames_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequestInvalid,
    RoomNotFound,
    RoomFull,
    AlreadyStarted,
    AlreadyInGame,
    SelfPlay,
    StakeVerificationFailed,
    NotParticipant,
    NotYourTurn,
    IllegalMove,
    InvalidMoveFormat,
    GameOver,
    GameNotStarted,
    NoActiveSession,
    RoomNoLongerExists,
    SignatureMismatch,
    InvalidSignature,
    TooManyRequests,
    AlreadyRegistered,
    InvalidFormat,
    Taken,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestInvalid => "REQUEST_INVALID",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::AlreadyInGame => "ALREADY_IN_GAME",
            Self::SelfPlay => "SELF_PLAY",
            Self::StakeVerificationFailed => "STAKE_VERIFICATION_FAILED",
            Self::NotParticipant => "NOT_PARTICIPANT",
            Self::NotYourTurn => "NOT_YOUR_TURN",
            Self::IllegalMove => "ILLEGAL_MOVE",
            Self::InvalidMoveFormat => "INVALID_MOVE_FORMAT",
            Self::GameOver => "GAME_OVER",
            Self::GameNotStarted => "GAME_NOT_STARTED",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::RoomNoLongerExists => "ROOM_NO_LONGER_EXISTS",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::AlreadyRegistered => "ALREADY_REGISTERED",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::Taken => "TAKEN",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    escrow: Option<PartialEscrowSection>,
    game: Option<PartialGameSection>,
    persistence: Option<PartialPersistenceSection>,
    observability: Option<PartialObservabilitySection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    ops_http_bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialEscrowSection {
    rpc_urls: Option<Vec<String>>,
    module_address: Option<String>,
    chain_id: Option<u64>,
    verify_max_attempts: Option<u32>,
    verify_backoff_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialGameSection {
    default_time_seconds: Option<u64>,
    reconnect_window_seconds: Option<u64>,
    draw_offer_ttl_seconds: Option<u64>,
    room_gc_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialPersistenceSection {
    usernames_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "coffeechess-coordinator".to_string(),
                ops_http_bind_addr: "127.0.0.1:9100".to_string(),
            },
            escrow: EscrowSection {
                rpc_urls: vec!["http://127.0.0.1:8545".to_string()],
                module_address: "0x0000000000000000000000000000000000000000".to_string(),
                chain_id: 1,
                verify_max_attempts: 15,
                verify_backoff_secs: 3,
            },
            game: GameSection {
                default_time_seconds: 300,
                reconnect_window_seconds: 60,
                draw_offer_ttl_seconds: 30,
                room_gc_seconds: 30,
            },
            persistence: PersistenceSection {
                usernames_path: "usernames.json".to_string(),
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("COFFEECHESS__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(bind_addr) = env::var("COFFEECHESS__OPS_HTTP_BIND_ADDR") {
            self.app.ops_http_bind_addr = bind_addr;
        }
        if let Ok(urls) = env::var("ESCROW__RPC_URLS") {
            self.escrow.rpc_urls = urls
                .split(',')
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect();
        }
        if let Ok(module_address) = env::var("ESCROW__MODULE_ADDRESS") {
            self.escrow.module_address = module_address;
        }
        if let Ok(chain_id) = env::var("ESCROW__CHAIN_ID") {
            self.escrow.chain_id =
                chain_id
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        key: "ESCROW__CHAIN_ID",
                        value: chain_id,
                    })?;
        }
        if let Ok(path) = env::var("PERSISTENCE__USERNAMES_PATH") {
            self.persistence.usernames_path = path;
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
            if let Some(value) = app.ops_http_bind_addr {
                self.app.ops_http_bind_addr = value;
            }
        }
        if let Some(escrow) = partial.escrow {
            if let Some(value) = escrow.rpc_urls {
                self.escrow.rpc_urls = value;
            }
            if let Some(value) = escrow.module_address {
                self.escrow.module_address = value;
            }
            if let Some(value) = escrow.chain_id {
                self.escrow.chain_id = value;
            }
            if let Some(value) = escrow.verify_max_attempts {
                self.escrow.verify_max_attempts = value;
            }
            if let Some(value) = escrow.verify_backoff_secs {
                self.escrow.verify_backoff_secs = value;
            }
        }
        if let Some(game) = partial.game {
            if let Some(value) = game.default_time_seconds {
                self.game.default_time_seconds = value;
            }
            if let Some(value) = game.reconnect_window_seconds {
                self.game.reconnect_window_seconds = value;
            }
            if let Some(value) = game.draw_offer_ttl_seconds {
                self.game.draw_offer_ttl_seconds = value;
            }
            if let Some(value) = game.room_gc_seconds {
                self.game.room_gc_seconds = value;
            }
        }
        if let Some(persistence) = partial.persistence {
            if let Some(value) = persistence.usernames_path {
                self.persistence.usernames_path = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("COFFEECHESS_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}
