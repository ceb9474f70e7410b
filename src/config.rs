use std::{env, str::FromStr, time::Duration};

use crate::error::AppError;

const DEFAULT_DEMO_BOOKING_URL: &str = "https://calendly.com/kanhasoft/demo";

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Gateway and worker in one process, notifications delivered in memory.
    All,
    /// HTTP/WebSocket surface plus the Postgres notification relay.
    Gateway,
    /// Queue consumer only; notifications published through Postgres.
    Worker,
}

impl Role {
    pub fn runs_gateway(self) -> bool {
        matches!(self, Role::All | Role::Gateway)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Role::All),
            "gateway" => Ok(Role::Gateway),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub port: u16,
    pub role: Role,
    pub log_level: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub cors_origins: Vec<String>,
    pub openai: OpenAiConfig,
    pub demo_booking_url: String,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match get("PORT").or_else(|| get("APP_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => 6000,
        };
        let role = match get("APP_ROLE") {
            Some(raw) => raw
                .parse::<Role>()
                .map_err(|err| AppError::Config(format!("APP_ROLE: {err}")))?,
            None => Role::All,
        };

        let openai = OpenAiConfig {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature: parse_or(&get, "OPENAI_TEMPERATURE", 0.7)?,
        };
        if role.runs_worker() && openai.api_key.is_none() {
            return Err(AppError::Config(
                "OPENAI_API_KEY must be set when the worker runs".to_string(),
            ));
        }

        let queue = QueueConfig {
            max_attempts: parse_or(&get, "JOB_MAX_ATTEMPTS", 3)?,
            backoff_base: Duration::from_millis(parse_or(&get, "JOB_BACKOFF_BASE_MS", 3000)?),
            backoff_max: Duration::from_millis(parse_or(&get, "JOB_BACKOFF_MAX_MS", 60_000)?),
            lock_timeout: Duration::from_secs(parse_or(&get, "JOB_LOCK_TIMEOUT_SECS", 300)?),
            poll_interval: Duration::from_millis(parse_or(&get, "WORKER_POLL_INTERVAL_MS", 500)?),
        };
        if queue.max_attempts < 1 {
            return Err(AppError::Config(
                "JOB_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or_else(|| "lead-chat".to_string()),
            port,
            role,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            database_url: resolve_database_url(&get),
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 10)?,
            cors_origins: get("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            openai,
            demo_booking_url: get("DEMO_BOOKING_URL")
                .unwrap_or_else(|| DEFAULT_DEMO_BOOKING_URL.to_string()),
            queue,
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, AppError> {
    raw.parse::<T>()
        .map_err(|_| AppError::Config(format!("{key} has an invalid value `{raw}`")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn resolve_database_url<G>(get: &G) -> String
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL").or_else(|| get("DB_URL")) {
        return url;
    }
    let host = get("POSTGRES_HOST")
        .or_else(|| get("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = get("POSTGRES_PASSWORD")
        .or_else(|| get("PGPASSWORD"))
        .unwrap_or_else(|| "postgres".to_string());
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "lead_chat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
