use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threadlink_channels::Presence;
use threadlink_core::{BridgeSettings, FirstMessagePolicy};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadlinkConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub discord: DiscordConfig,
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_name")]
    pub name: String,
    /// Relay everything regardless of per-binding flags
    #[serde(default)]
    pub global_relay: bool,
    #[serde(default = "default_true")]
    pub default_allow: bool,
    #[serde(default)]
    pub first_message: FirstMessagePolicy,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    #[serde(default = "default_fallback_prefix")]
    pub fallback_name_prefix: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_events: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            global_relay: false,
            default_allow: true,
            first_message: FirstMessagePolicy::default(),
            network_timeout_secs: default_network_timeout(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            fallback_name_prefix: default_fallback_prefix(),
            max_concurrent_events: default_max_concurrent(),
        }
    }
}

fn default_bridge_name() -> String {
    "Threadlink".to_string()
}

fn default_true() -> bool {
    true
}

fn default_network_timeout() -> u64 {
    30
}

fn default_housekeeping_interval() -> u64 {
    300
}

fn default_fallback_prefix() -> String {
    "User ".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

#[derive(Clone, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,
    pub guild_id: String,
    /// Member who can see every bridged channel
    pub admin_id: String,
    #[serde(default = "default_category")]
    pub category_name: String,
    #[serde(default)]
    pub presence: Option<Presence>,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("token", &mask_secret(&self.token))
            .field("guild_id", &self.guild_id)
            .field("admin_id", &self.admin_id)
            .field("category_name", &self.category_name)
            .field("presence", &self.presence)
            .finish()
    }
}

fn default_category() -> String {
    "facebook".to_string()
}

#[derive(Clone, Deserialize)]
pub struct MessengerConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    /// Serialized login state; empty means the gateway is already logged in
    #[serde(default)]
    pub app_state: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl std::fmt::Debug for MessengerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerConfig")
            .field("base_url", &self.base_url)
            .field("token", &mask_secret(&self.token))
            .field("app_state", &mask_secret(&self.app_state))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("health_interval_secs", &self.health_interval_secs)
            .finish()
    }
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_health_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_db_path() -> String {
    "~/.threadlink/threadlink.db".to_string()
}

fn default_cache_capacity() -> usize {
    threadlink_store::DEFAULT_NAME_CACHE_CAPACITY
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for values longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threadlink")
}

/// Config file in use: `--config` or the default location
pub fn config_path(custom_path: &Option<PathBuf>) -> PathBuf {
    custom_path
        .clone()
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

impl ThreadlinkConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = config_path(custom_path);

        // Tokens live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `threadlink init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        if !config.discord.token.is_empty() && !content.contains("${DISCORD_BOT_TOKEN}") {
            warn!(
                "Discord token is hardcoded in config file. For security, use environment variables: token = \"${{DISCORD_BOT_TOKEN}}\""
            );
        }

        Ok(config)
    }

    /// Parse TOML text after expanding allowlisted `${VAR}`s
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.discord.token.trim().is_empty() {
            return Err(anyhow!("[discord] token is empty (set DISCORD_BOT_TOKEN)"));
        }
        for (field, value) in [
            ("guild_id", &self.discord.guild_id),
            ("admin_id", &self.discord.admin_id),
        ] {
            if value.trim().is_empty() || value.trim().parse::<u64>().is_err() {
                return Err(anyhow!("[discord] {} must be a numeric Discord id, got '{}'", field, value));
            }
        }
        if self.bridge.max_concurrent_events == 0 {
            return Err(anyhow!("[bridge] max_concurrent_events must be at least 1"));
        }
        if self.bridge.network_timeout_secs == 0 {
            return Err(anyhow!("[bridge] network_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    /// Settings handed to the bridge core
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings::new(&self.bridge.name, &self.discord.admin_id, &self.discord.guild_id)
            .with_category(&self.discord.category_name)
            .with_first_message(self.bridge.first_message)
            .with_default_allow(self.bridge.default_allow)
            .with_network_timeout(Duration::from_secs(self.bridge.network_timeout_secs))
            .with_fallback_name_prefix(&self.bridge.fallback_name_prefix)
            .with_global_relay(self.bridge.global_relay)
    }

    pub fn app_state(&self) -> Option<String> {
        Some(self.messenger.app_state.clone()).filter(|s| !s.trim().is_empty())
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &[
    "DISCORD_BOT_TOKEN",
    "MESSENGER_GATEWAY_TOKEN",
    "MESSENGER_APP_STATE",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}

/// Set `global_relay` under `[bridge]`, keeping the rest of the file as written
pub fn rewrite_global_relay(content: &str, enabled: bool) -> String {
    let setting = format!("global_relay = {}", enabled);
    let mut out: Vec<String> = Vec::new();
    let mut section = String::new();
    let mut saw_bridge = false;
    let mut written = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            if section == "[bridge]" && !written {
                out.push(setting.clone());
                written = true;
            }
            section = trimmed.to_string();
            saw_bridge |= section == "[bridge]";
        } else if section == "[bridge]" && !written && is_key(trimmed, "global_relay") {
            out.push(setting.clone());
            written = true;
            continue;
        }
        out.push(line.to_string());
    }

    if !written {
        if section == "[bridge]" {
            out.push(setting);
        } else if !saw_bridge {
            out.insert(0, String::new());
            out.insert(0, setting);
            out.insert(0, "[bridge]".to_string());
        }
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

fn is_key(line: &str, key: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(name, _)| name.trim() == key)
}

/// Persist the global relay flag into the config file
pub fn write_global_relay(path: &Path, enabled: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    std::fs::write(path, rewrite_global_relay(&content, enabled))
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}
