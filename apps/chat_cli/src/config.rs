use std::{collections::HashMap, fs, path::Path, path::PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub api_base_url: String,
    pub socket_url: Option<String>,
    pub session_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000".into(),
            socket_url: None,
            session_file: None,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    /// Base the websocket endpoint is derived from; the API origin unless a
    /// socket URL is configured.
    pub fn socket_origin(&self) -> &str {
        self.socket_url.as_deref().unwrap_or(&self.api_base_url)
    }
}

pub fn load_settings(config_path: &Path) -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(config_path) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("api_base_url") {
        settings.api_base_url = v.clone();
    }
    if let Some(v) = file_cfg.get("socket_url") {
        settings.socket_url = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("session_file") {
        settings.session_file = Some(PathBuf::from(v));
    }
    if let Some(v) = file_cfg.get("log_filter") {
        settings.log_filter = v.clone();
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("CHAT_SOCKET_URL") {
        settings.socket_url = Some(v);
    }
    if let Some(v) = var("APP__SOCKET_URL") {
        settings.socket_url = Some(v);
    }

    if let Some(v) = var("APP__SESSION_FILE") {
        settings.session_file = Some(PathBuf::from(v));
    }

    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}
