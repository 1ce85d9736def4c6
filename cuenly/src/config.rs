//! Process configuration, assembled from the environment variables in
//! the external-interfaces table. Only `EMAIL_CONFIG_ENCRYPTION_KEY` is
//! mandatory; every other key has a documented default.

use std::env;

use anyhow::{Context, anyhow};

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parsed_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{key} is set but not a valid value: {raw:?}")),
        None => Ok(default),
    }
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
    pub ssl: bool,
}

impl RedisConfig {
    pub fn to_url(&self) -> String {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => {
                format!("{scheme}://:{password}@{}:{}/{}", self.host, self.port, self.db)
            }
            None => format!("{scheme}://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MongoConfig {
    pub url: String,
    pub database: String,
}

#[derive(Clone, Debug)]
pub struct MinioConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub use_ssl: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub redis: RedisConfig,
    pub mongo: MongoConfig,
    pub email_config_encryption_key: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub job_interval_minutes: u32,
    pub job_restore_on_boot: bool,
    pub job_owner_ttl_seconds: u64,
    pub minio: Option<MinioConfig>,
    pub temp_pdf_dir: String,
    pub timezone: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let redis = RedisConfig {
            host: env_or("REDIS_HOST", "127.0.0.1"),
            port: env_parsed_or("REDIS_PORT", 6379u16)?,
            password: env_opt("REDIS_PASSWORD"),
            db: env_parsed_or("REDIS_DB", 0u8)?,
            ssl: env_parsed_or("REDIS_SSL", false)?,
        };

        let mongo = MongoConfig {
            url: env_opt("MONGODB_URL").context("MONGODB_URL was not set")?,
            database: env_or("MONGODB_DATABASE", "cuenly"),
        };

        let email_config_encryption_key = env_opt("EMAIL_CONFIG_ENCRYPTION_KEY")
            .context("EMAIL_CONFIG_ENCRYPTION_KEY was not set")?;

        let minio = match (
            env_opt("MINIO_ENDPOINT"),
            env_opt("MINIO_ACCESS_KEY"),
            env_opt("MINIO_SECRET_KEY"),
            env_opt("MINIO_BUCKET"),
        ) {
            (Some(endpoint), Some(access_key), Some(secret_key), Some(bucket)) => {
                Some(MinioConfig {
                    endpoint,
                    access_key,
                    secret_key,
                    bucket,
                    use_ssl: env_parsed_or("MINIO_USE_SSL", true)?,
                })
            }
            _ => None,
        };

        Ok(Self {
            redis,
            mongo,
            email_config_encryption_key,
            openai_api_key: env_opt("OPENAI_API_KEY"),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            job_interval_minutes: env_parsed_or("JOB_INTERVAL_MINUTES", 15u32)?,
            job_restore_on_boot: env_parsed_or("JOB_RESTORE_ON_BOOT", false)?,
            job_owner_ttl_seconds: env_parsed_or("JOB_OWNER_TTL_SECONDS", 120u64)?,
            minio,
            temp_pdf_dir: env_or("TEMP_PDF_DIR", "/tmp/cuenly"),
            timezone: env_or("TIMEZONE", "America/Asuncion"),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redis_url_includes_password_when_set() {
        let config = RedisConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: Some("hunter2".to_string()),
            db: 2,
            ssl: true,
        };
        assert_eq!(config.to_url(), "rediss://:hunter2@redis.internal:6380/2");
    }

    #[test]
    fn redis_url_omits_credentials_when_unset() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            ssl: false,
        };
        assert_eq!(config.to_url(), "redis://localhost:6379/0");
    }
}
