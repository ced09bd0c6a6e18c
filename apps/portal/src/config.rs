use anyhow::{Context, Result};
use serde::Serialize;

/// Which identity source is authoritative. Derived once at startup and never
/// re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationMode {
    Remote,
    Local,
}

/// Connection parameters for the remote identity provider.
#[derive(Debug, Clone)]
pub struct RemoteAuthConfig {
    pub url: String,
    pub anon_key: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub remote_auth: Option<RemoteAuthConfig>,
    pub fallback_store_path: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            remote_auth: remote_auth_from(
                optional_env("AUTH_URL").as_deref(),
                optional_env("AUTH_ANON_KEY").as_deref(),
            ),
            fallback_store_path: optional_env("FALLBACK_STORE_PATH"),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn mode(&self) -> ConfigurationMode {
        if self.remote_auth.is_some() {
            ConfigurationMode::Remote
        } else {
            ConfigurationMode::Local
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Both parameters must be present and real; template values from a copied
/// `.env.example` put the portal in local mode.
fn remote_auth_from(url: Option<&str>, anon_key: Option<&str>) -> Option<RemoteAuthConfig> {
    let url = url?.trim();
    let anon_key = anon_key?.trim();

    if is_placeholder(url) || is_placeholder(anon_key) {
        return None;
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return None;
    }

    Some(RemoteAuthConfig {
        url: url.to_string(),
        anon_key: anon_key.to_string(),
    })
}

fn is_placeholder(value: &str) -> bool {
    const MARKERS: [&str; 5] = ["your-project", "your_", "placeholder", "example", "<"];
    let lowered = value.to_ascii_lowercase();
    lowered.is_empty() || MARKERS.iter().any(|m| lowered.contains(m))
}
