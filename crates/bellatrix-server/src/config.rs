use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// JWT secrets that only belong in development.
pub const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_UPLOAD_MB: usize = 10;

/// Server settings, read from `BELLATRIX_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub db_readers: usize,
    pub upload_dir: PathBuf,
    pub static_dir: PathBuf,
    pub jwt_secret: String,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key -> value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match var("BELLATRIX_PORT").or_else(|| var("PORT")) {
            Some(raw) => raw.parse().with_context(|| format!("invalid port: {}", raw))?,
            None => DEFAULT_PORT,
        };

        let db_readers = match var("BELLATRIX_DB_READERS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid BELLATRIX_DB_READERS: {}", raw))?,
            None => bellatrix_db::DEFAULT_READER_POOL_SIZE,
        };
        if db_readers == 0 {
            bail!("BELLATRIX_DB_READERS must be at least 1");
        }

        let max_upload_mb: usize = match var("BELLATRIX_MAX_UPLOAD_MB") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid BELLATRIX_MAX_UPLOAD_MB: {}", raw))?,
            None => DEFAULT_MAX_UPLOAD_MB,
        };

        let Some(max_upload_bytes) = max_upload_mb.checked_mul(1024 * 1024) else {
            bail!("BELLATRIX_MAX_UPLOAD_MB is too large: {}", max_upload_mb);
        };

        Ok(Self {
            host: var("BELLATRIX_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("BELLATRIX_DB_PATH").unwrap_or_else(|| "bellatrix.db".into()).into(),
            db_readers,
            upload_dir: var("BELLATRIX_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into()).into(),
            static_dir: var("BELLATRIX_STATIC_DIR").unwrap_or_else(|| "./public".into()).into(),
            jwt_secret: var("BELLATRIX_JWT_SECRET").unwrap_or_else(|| DEFAULT_JWT_SECRET.into()),
            max_upload_bytes,
        })
    }

    pub fn has_placeholder_secret(&self) -> bool {
        PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.port, 3000);
        assert_eq!(c.db_path, PathBuf::from("bellatrix.db"));
        assert_eq!(c.db_readers, bellatrix_db::DEFAULT_READER_POOL_SIZE);
        assert_eq!(c.upload_dir, PathBuf::from("./uploads"));
        assert_eq!(c.static_dir, PathBuf::from("./public"));
        assert_eq!(c.max_upload_bytes, 10 * 1024 * 1024);
        assert!(c.has_placeholder_secret());
    }

    #[test]
    fn port_falls_back_to_plain_port() {
        assert_eq!(config(&[("PORT", "8080")]).unwrap().port, 8080);
        assert_eq!(
            config(&[("PORT", "8080"), ("BELLATRIX_PORT", "9000")]).unwrap().port,
            9000
        );
        // Blank values count as unset
        assert_eq!(config(&[("BELLATRIX_PORT", "  ")]).unwrap().port, 3000);
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(config(&[("BELLATRIX_PORT", "http")]).is_err());
        assert!(config(&[("BELLATRIX_DB_READERS", "0")]).is_err());
        assert!(config(&[("BELLATRIX_MAX_UPLOAD_MB", "-1")]).is_err());
        assert!(config(&[("BELLATRIX_MAX_UPLOAD_MB", usize::MAX.to_string().as_str())]).is_err());
        assert_eq!(
            config(&[("BELLATRIX_MAX_UPLOAD_MB", "25")]).unwrap().max_upload_bytes,
            25 * 1024 * 1024
        );
    }

    #[test]
    fn real_secret_is_not_a_placeholder() {
        let c = config(&[("BELLATRIX_JWT_SECRET", "k3J9s0aQ")]).unwrap();
        assert!(!c.has_placeholder_secret());
    }
}
