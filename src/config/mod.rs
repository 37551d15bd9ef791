use anyhow::{anyhow, bail, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::autosave::AutosaveOverrides;
use crate::codec::Compression;
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "AutosaveOverrides::is_empty")]
    pub autosave: AutosaveOverrides,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "account",
    "remote_url",
    "token",
    "data_dir",
    "compression",
    "autosave.save_every_ms",
    "autosave.idle_after_ms",
    "autosave.tick_ms",
    "autosave.retry_base_ms",
    "autosave.retry_max_ms",
    "autosave.online_retry_ms",
];

impl AutosaveOverrides {
    fn field(&self, name: &str) -> Option<u64> {
        match name {
            "save_every_ms" => self.save_every_ms,
            "idle_after_ms" => self.idle_after_ms,
            "tick_ms" => self.tick_ms,
            "retry_base_ms" => self.retry_base_ms,
            "retry_max_ms" => self.retry_max_ms,
            "online_retry_ms" => self.online_retry_ms,
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Option<u64>> {
        match name {
            "save_every_ms" => Some(&mut self.save_every_ms),
            "idle_after_ms" => Some(&mut self.idle_after_ms),
            "tick_ms" => Some(&mut self.tick_ms),
            "retry_base_ms" => Some(&mut self.retry_base_ms),
            "retry_max_ms" => Some(&mut self.retry_max_ms),
            "online_retry_ms" => Some(&mut self.online_retry_ms),
            _ => None,
        }
    }

    fn merge(&self, other: &AutosaveOverrides) -> AutosaveOverrides {
        AutosaveOverrides {
            save_every_ms: other.save_every_ms.or(self.save_every_ms),
            idle_after_ms: other.idle_after_ms.or(self.idle_after_ms),
            tick_ms: other.tick_ms.or(self.tick_ms),
            retry_base_ms: other.retry_base_ms.or(self.retry_base_ms),
            retry_max_ms: other.retry_max_ms.or(self.retry_max_ms),
            online_retry_ms: other.online_retry_ms.or(self.online_retry_ms),
        }
    }
}

impl Config {
    pub fn get_field(&self, key: &str) -> Option<String> {
        if let Some(name) = key.strip_prefix("autosave.") {
            return self.autosave.field(name).map(|v| v.to_string());
        }
        match key {
            "account" => self.account.clone(),
            "remote_url" => self.remote_url.clone(),
            "token" => self.token.clone(),
            "data_dir" => self.data_dir.clone(),
            "compression" => self.compression.clone(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, key: &str, value: String) -> Result<()> {
        if let Some(name) = key.strip_prefix("autosave.") {
            let ms: u64 = value
                .parse()
                .map_err(|_| anyhow!("{key} expects milliseconds, got '{value}'"))?;
            let slot = self
                .autosave
                .field_mut(name)
                .ok_or_else(|| anyhow!("Unknown config key: {key}"))?;
            *slot = Some(ms);
            return Ok(());
        }
        match key {
            "account" => self.account = Some(value),
            "remote_url" => self.remote_url = Some(value),
            "token" => self.token = Some(value),
            "data_dir" => self.data_dir = Some(value),
            "compression" => {
                Compression::from_config(&value)?;
                self.compression = Some(value)
            }
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        if let Some(name) = key.strip_prefix("autosave.") {
            return match self.autosave.field_mut(name) {
                Some(slot) => {
                    *slot = None;
                    true
                }
                None => false,
            };
        }
        match key {
            "account" => self.account = None,
            "remote_url" => self.remote_url = None,
            "token" => self.token = None,
            "data_dir" => self.data_dir = None,
            "compression" => self.compression = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&'static str, String)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            account: other.account.clone().or_else(|| self.account.clone()),
            remote_url: other.remote_url.clone().or_else(|| self.remote_url.clone()),
            token: other.token.clone().or_else(|| self.token.clone()),
            data_dir: other.data_dir.clone().or_else(|| self.data_dir.clone()),
            compression: other.compression.clone().or_else(|| self.compression.clone()),
            autosave: self.autosave.merge(&other.autosave),
            extra,
        }
    }
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("stitch"));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join("stitch"))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Error,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Error,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut current_dir = std::env::current_dir().ok()?;

    loop {
        if current_dir.join(".stitch").is_dir() {
            return Some(current_dir.join(".stitch"));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
/// Without a flag the nearest local config wins, then the global one.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    match local_path() {
        Some(p) => Ok(p),
        None if local => {
            bail!("No local .stitch directory found. Create one with `mkdir .stitch` first.")
        }
        None => global_path(),
    }
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/stitch/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.stitch/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source
        #[arg(long)]
        verbose: bool,
    },
    /// Get a config value
    Get {
        /// Config key (account, remote_url, token, data_dir, compression, autosave.*)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (account, remote_url, token, data_dir, compression, autosave.*)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (account, remote_url, token, data_dir, compression, autosave.*)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, verbose }) => {
            list::run(base, scope.global, scope.local, verbose)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
