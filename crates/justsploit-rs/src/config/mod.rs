use std::{env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{adapters::ToolSettings, models::ToolKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub nmap_path: String,
    pub whatweb_path: String,
    /// nmap `-T` value, 0 (paranoid) to 5 (insane)
    pub nmap_timing: u8,
    pub port_scan_timeout_secs: u64,
    pub fingerprint_timeout_secs: u64,
    pub workers: usize,
    pub database_url: String,
    /// how long terminal task results stay answerable
    pub result_ttl_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("JUSTSPLOIT_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        cfg.nmap_timing = cfg.nmap_timing.min(5);
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("JS_NMAP_PATH") {
            self.nmap_path = v;
        }
        if let Some(v) = var("JS_WHATWEB_PATH") {
            self.whatweb_path = v;
        }
        if let Some(v) = var("JS_NMAP_TIMING") {
            self.nmap_timing = v.parse().unwrap_or(self.nmap_timing);
        }
        if let Some(v) = var("JS_PORT_SCAN_TIMEOUT_SECS") {
            self.port_scan_timeout_secs = v.parse().unwrap_or(self.port_scan_timeout_secs);
        }
        if let Some(v) = var("JS_FINGERPRINT_TIMEOUT_SECS") {
            self.fingerprint_timeout_secs = v.parse().unwrap_or(self.fingerprint_timeout_secs);
        }
        if let Some(v) = var("JS_WORKERS") {
            self.workers = v.parse().unwrap_or(self.workers);
        }
        if let Some(v) = var("JS_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("JS_RESULT_TTL_SECS") {
            self.result_ttl_secs = v.parse().unwrap_or(self.result_ttl_secs);
        }
    }

    pub fn tools(&self) -> ToolSettings {
        ToolSettings {
            nmap_path: self.nmap_path.clone(),
            whatweb_path: self.whatweb_path.clone(),
            nmap_timing: self.nmap_timing.min(5),
        }
    }

    pub fn timeout_for(&self, tool: ToolKind) -> Duration {
        match tool {
            ToolKind::PortScan => Duration::from_secs(self.port_scan_timeout_secs),
            ToolKind::Fingerprint => Duration::from_secs(self.fingerprint_timeout_secs),
        }
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            whatweb_path: "whatweb".to_string(),
            nmap_timing: 3,
            port_scan_timeout_secs: 30 * 60,
            fingerprint_timeout_secs: 300,
            workers: 2,
            database_url: "sqlite://justsploit.db?mode=rwc".to_string(),
            result_ttl_secs: 24 * 60 * 60,
        }
    }
}
