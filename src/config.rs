use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::util::{env_non_empty, is_local_endpoint_url};

pub const DEFAULT_UPSTREAM_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PROXY_URL: &str = "http://localhost:8080/chat";

/// Settings for the `hydro-proxy` relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub upstream_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub bind_addr: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn load() -> Result<Self> {
        let upstream_url =
            env_non_empty("HYDRO_UPSTREAM_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let api_key = env_non_empty("HYDRO_API_KEY").or_else(|| env_non_empty("GEMINI_API_KEY"));
        let model = env_non_empty("HYDRO_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let bind_addr =
            env_non_empty("HYDRO_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let port = match env_non_empty("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("Invalid PORT '{raw}': expected an integer 0-65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            upstream_url,
            api_key,
            model,
            bind_addr,
            port,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.upstream_url) {
            bail!(
                "Invalid HYDRO_UPSTREAM_URL '{}': expected http:// or https:// URL",
                self.upstream_url
            );
        }

        if !is_local_endpoint_url(&self.upstream_url) && self.api_key.is_none() {
            bail!(
                "HYDRO_API_KEY (or GEMINI_API_KEY) must be set for non-local upstreams (url: '{}')",
                self.upstream_url
            );
        }

        if self.model.trim().is_empty() {
            bail!("HYDRO_MODEL must not be empty");
        }

        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid HYDRO_BIND_ADDR '{}'", self.bind_addr))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Settings for the `hydro` client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub proxy_url: String,
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        Ok(Self {
            proxy_url: env_non_empty("HYDRO_PROXY_URL")
                .unwrap_or_else(|| DEFAULT_PROXY_URL.to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.proxy_url) {
            bail!(
                "Invalid HYDRO_PROXY_URL '{}': expected http:// or https:// URL",
                self.proxy_url
            );
        }
        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
