use std::{env, time::Duration};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub database_url: String,
    pub verify_token: String,
    pub app_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub ai_timeout: Duration,
    pub handover_keywords: Vec<String>,
    pub business_name: String,
    pub bot_persona: String,
    pub whatsapp_access_token: String,
    pub whatsapp_phone_number_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            store: StoreKind::Postgres,
            database_url: String::new(),
            verify_token: String::new(),
            app_secret: String::new(),
            openai_api_key: String::new(),
            openai_model: "gpt-4o".to_string(),
            ai_timeout: Duration::from_secs(20),
            handover_keywords: vec!["AGENTE".to_string()],
            business_name: String::new(),
            bot_persona: String::new(),
            whatsapp_access_token: String::new(),
            whatsapp_phone_number_id: String::new(),
        }
    }
}

fn var(key: &str) -> String {
    env::var(key).map(|v| v.trim().to_string()).unwrap_or_default()
}

fn var_or(key: &str, fallback: &str) -> String {
    let value = var(key);
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = match var("PORT") {
            raw if raw.is_empty() => defaults.port,
            raw => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw,
            })?,
        };

        let store = match var("STORE").to_ascii_lowercase().as_str() {
            "" | "postgres" => StoreKind::Postgres,
            "memory" => StoreKind::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORE",
                    value: other.to_string(),
                })
            }
        };

        let ai_timeout = match var("AI_TIMEOUT_SECS") {
            raw if raw.is_empty() => defaults.ai_timeout,
            raw => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid {
                    key: "AI_TIMEOUT_SECS",
                    value: raw,
                })?,
        };

        let handover_keywords = parse_keywords(&var("HANDOVER_KEYWORDS"));

        Ok(Self {
            port,
            store,
            database_url: resolve_database_url(),
            verify_token: var("META_VERIFY_TOKEN"),
            app_secret: var("META_APP_SECRET"),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: var_or("OPENAI_MODEL", &defaults.openai_model),
            ai_timeout,
            handover_keywords: if handover_keywords.is_empty() {
                defaults.handover_keywords
            } else {
                handover_keywords
            },
            business_name: var("BUSINESS_NAME"),
            bot_persona: var("BOT_PERSONA"),
            whatsapp_access_token: var("WHATSAPP_ACCESS_TOKEN"),
            whatsapp_phone_number_id: var("WHATSAPP_PHONE_NUMBER_ID"),
        })
    }
}

pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_database_url() -> String {
    let url = var("DATABASE_URL");
    if !url.is_empty() {
        return url;
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "inbox_relay".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
