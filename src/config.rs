use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use crate::events::EventType;
use crate::ussd::UssdEncoding;

macro_rules! env_config {
    // Required field
    ($field_name:ident: $field_type:ty, $env_var:literal) => {
        (|| -> anyhow::Result<$field_type> {
            std::env::var($env_var)
                .map_err(|_| anyhow::anyhow!("Required environment variable '{}' is missing", $env_var))
                .and_then(|v| v.parse::<$field_type>()
                    .map_err(|e| anyhow::anyhow!("Failed to parse '{}' as {}: {}", $env_var, stringify!($field_type), e)))
        })()
    };

    // Optional field with default
    ($field_name:ident: $field_type:ty, $env_var:literal, $default:expr) => {
        (|| -> anyhow::Result<$field_type> {
            match std::env::var($env_var) {
                Ok(v) => v.parse::<$field_type>()
                    .map_err(|e| anyhow::anyhow!("Failed to parse '{}' as {}: {}", $env_var, stringify!($field_type), e)),
                Err(_) => Ok($default)
            }
        })()
    };
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,

    #[serde(default)]
    pub webhooks: Option<Vec<ConfiguredWebhook>>,

    #[serde(default)]
    pub http: HTTPConfig
}
impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse TOML: {}", e))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.log_level = env_config!(log_level: String, "GSM_ENDPOINT_LOG_LEVEL", self.log_level.clone())?;
        if let Ok(token) = env_config!(http_token: String, "GSM_ENDPOINT_HTTP_TOKEN") {
            self.http.token = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            bail!("At least one [[interfaces]] entry is required");
        }

        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if interface.name.trim().is_empty() {
                bail!("Interface on {} has an empty name", interface.device);
            }
            if !names.insert(interface.name.as_str()) {
                bail!("Interface name {} is used more than once", interface.name);
            }
            if interface.cmd_channel_buffer_size == 0 {
                bail!("Interface {} needs a cmd_channel_buffer_size above zero", interface.name);
            }
        }

        if self.http.enabled && self.http.require_authentication && self.http.token.is_none() {
            bail!("HTTP authentication is required but no token is set (GSM_ENDPOINT_HTTP_TOKEN)");
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One modem, driven by its own session worker.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Interval between status refreshes (signal, battery, registration).
    #[serde(default = "default_sync_period_secs")]
    pub sync_period_secs: u64,

    /// The size of Command bounded mpsc sender, should be low. eg: 32
    #[serde(default = "default_cmd_channel_buffer_size")]
    pub cmd_channel_buffer_size: usize,

    #[serde(default = "default_pause_ms")]
    pub initial_pause_ms: u64,

    #[serde(default = "default_pause_ms")]
    pub after_preinit_pause_ms: u64,

    #[serde(default)]
    pub ussd_request_encoding: UssdEncoding,

    #[serde(default)]
    pub ussd_response_encoding: UssdEncoding,

    #[serde(default)]
    pub no_ucs2: bool,

    #[serde(default)]
    pub has_clcc: bool,

    #[serde(default)]
    pub has_ecam: bool,

    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,

    #[serde(default)]
    pub dialect: AtDialect
}
impl InterfaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: default_device(),
            baud: default_baud(),
            sync_period_secs: default_sync_period_secs(),
            cmd_channel_buffer_size: default_cmd_channel_buffer_size(),
            initial_pause_ms: default_pause_ms(),
            after_preinit_pause_ms: default_pause_ms(),
            ussd_request_encoding: UssdEncoding::default(),
            ussd_response_encoding: UssdEncoding::default(),
            no_ucs2: false,
            has_clcc: false,
            has_ecam: false,
            answer_timeout_secs: default_answer_timeout_secs(),
            dialect: AtDialect::default()
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }
}

fn default_device() -> String {
    "/dev/ttyUSB3".to_string()
}

fn default_baud() -> u32 {
    115200
}

fn default_sync_period_secs() -> u64 {
    300
}

fn default_cmd_channel_buffer_size() -> usize {
    32
}

fn default_pause_ms() -> u64 {
    500
}

fn default_answer_timeout_secs() -> u64 {
    10
}

/// Per-modem command strings and the unsolicited literals it is known to send.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtDialect {
    pub dial_pre_number: String,
    pub dial_post_number: String,
    pub dial_expect: String,
    pub hangup: String,
    pub hangup_expect: String,
    pub answer: String,
    pub answer_expect: String,
    pub send_dtmf: String,
    pub preinit: Vec<String>,
    pub postinit: Vec<String>,
    pub query_battery: String,
    pub query_signal: String,

    pub call_idle: String,
    pub call_incoming: String,
    pub call_active: String,
    pub call_calling: String,
    pub call_failed: String,

    pub no_service: String,
    pub no_signal: String,
    pub low_signal: String,
    pub low_battery: String,
    pub no_battery: String,
    pub call_active_indicator: String,
    pub no_call_active: String,
    pub no_call_setup: String,
    pub call_setup_incoming: String,
    pub call_setup_outgoing: String,
    pub remote_ringing: String
}
impl Default for AtDialect {
    fn default() -> Self {
        Self {
            dial_pre_number: "ATD".to_string(),
            dial_post_number: ";".to_string(),
            dial_expect: "OK".to_string(),
            hangup: "ATH".to_string(),
            hangup_expect: "OK".to_string(),
            answer: "ATA".to_string(),
            answer_expect: "OK".to_string(),
            send_dtmf: "AT^DTMF".to_string(),
            preinit: Vec::new(),
            postinit: vec![
                "at+cmic=0,9".to_string(),
                "AT+CKPD=\"EEE\"".to_string(),
                "AT+CSSN=1,0".to_string(),
                "at+sidet=0".to_string(),
                "at+clvl=3".to_string()
            ],
            query_battery: "AT+CBC".to_string(),
            query_signal: "AT+CSQ".to_string(),

            call_idle: "+MCST: 1".to_string(),
            call_incoming: "RING".to_string(),
            call_active: "^CONN:1,0".to_string(),
            call_calling: "^ORIG:1,0".to_string(),
            call_failed: "+MCST: 65".to_string(),

            no_service: "CIEV: 2;0".to_string(),
            no_signal: "CIEV: 5;0".to_string(),
            low_signal: "CIEV: 5;1".to_string(),
            low_battery: "CIEV: 0;1".to_string(),
            no_battery: "CIEV: 0;0".to_string(),
            call_active_indicator: "CIEV: 3;1".to_string(),
            no_call_active: "CIEV: 3;0".to_string(),
            no_call_setup: "CIEV: 6;0".to_string(),
            call_setup_incoming: "CIEV: 6;1".to_string(),
            call_setup_outgoing: "CIEV: 6;2".to_string(),
            remote_ringing: "CIEV: 6;3".to_string()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HTTPConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    #[serde(default = "default_http_address")]
    pub address: SocketAddr,

    #[serde(default)]
    pub require_authentication: bool,

    /// Bearer token, normally provided through GSM_ENDPOINT_HTTP_TOKEN.
    #[serde(default)]
    pub token: Option<String>
}
impl Default for HTTPConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            address: default_http_address(),
            require_authentication: false,
            token: None
        }
    }
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguredWebhook {
    pub url: String,

    #[serde(default = "default_webhook_events")]
    pub events: Vec<EventType>,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub expected_status: Option<u16>
}
impl ConfiguredWebhook {
    pub fn get_header_map(&self) -> Result<Option<HeaderMap>> {
        let Some(headers) = &self.headers else {
            return Ok(None);
        };

        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            map.insert(name, value);
        }
        Ok(Some(map))
    }
}

fn default_webhook_events() -> Vec<EventType> {
    vec![EventType::IncomingSms]
}
