use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
    pub gemini_api_key: String,
    pub gemini_model: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("HOST", "127.0.0.1"),
            port: env_or("PORT", "8000")
                .parse()
                .context("PORT must be a number")?,
            database_url: env_or("DATABASE_URL", "sqlite://contracts.db"),
            jwt_secret: std::env::var("SECRET_KEY").context("SECRET_KEY is required")?,
            access_token_expire_minutes: env_or("ACCESS_TOKEN_EXPIRE_MINUTES", "30")
                .parse()
                .context("ACCESS_TOKEN_EXPIRE_MINUTES must be a number")?,
            gemini_api_key: std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is required")?,
            gemini_model: env_or("GEMINI_MODEL", "gemini-2.5-flash"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
