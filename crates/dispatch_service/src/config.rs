use std::env;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use dispatch_core::config::EngineConfig;
use dispatch_core::pricing::Tariff;
use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    /// Straight-line estimates are used when unset.
    pub osrm_endpoint: Option<String>,
    pub gateway_endpoint: String,
    pub maintenance_interval: Duration,
    pub engine: EngineConfig,
    pub tariffs: Vec<Tariff>,
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("BIND_ADDR is not a socket address")?;
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let osrm_endpoint = env::var("OSRM_ENDPOINT").ok().filter(|url| !url.is_empty());
        let gateway_endpoint =
            env::var("GATEWAY_ENDPOINT").unwrap_or_else(|_| "http://localhost:8090".to_string());
        let maintenance_secs = env::var("MAINTENANCE_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let engine = match env::var("DISPATCH_CONFIG") {
            Ok(path) => {
                let json = fs::read_to_string(&path)
                    .with_context(|| format!("reading engine config {path}"))?;
                EngineConfig::from_json(&json)
                    .with_context(|| format!("parsing engine config {path}"))?
            }
            Err(_) => EngineConfig::default(),
        };

        let tariffs = match env::var("TARIFFS") {
            Ok(path) => {
                let json = fs::read_to_string(&path)
                    .with_context(|| format!("reading tariffs {path}"))?;
                serde_json::from_str(&json).with_context(|| format!("parsing tariffs {path}"))?
            }
            Err(_) => Vec::new(),
        };

        Ok(Self {
            bind_addr,
            log_level,
            osrm_endpoint,
            gateway_endpoint,
            maintenance_interval: Duration::from_secs(maintenance_secs.max(1)),
            engine,
            tariffs,
        })
    }
}
