//! # SpinPlayer Configuration Module
//!
//! This module provides configuration management for SpinPlayer, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe singleton access pattern
//!
//! ## Usage
//!
//! ```no_run
//! use spnconfig::get_config;
//!
//! let config = get_config();
//! let target = config.get_buffer_target_ms()?;
//! config.set_static_delay_ms(40.0)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::info;
use uuid::Uuid;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("spinplayer.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load SpinPlayer configuration"));
}

const ENV_CONFIG_DIR: &str = "SPINPLAYER_CONFIG";
const ENV_PREFIX: &str = "SPINPLAYER_CONFIG__";

/// Macro to generate getter/setter for f64 values with default
macro_rules! impl_f64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<f64> {
            match self.get_value($path)? {
                Value::Number(n) => Ok(n.as_f64().unwrap_or($default)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: f64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Macro to generate getter/setter for u64 values with default
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            match self.get_value($path)? {
                Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap()),
                Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap().max(0) as u64),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path)? {
                Value::Bool(b) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Macro to generate getter/setter for string values with default
macro_rules! impl_string_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<String> {
            match self.get_value($path)? {
                Value::String(s) => Ok(s),
                _ => Ok($default.to_string()),
            }
        }

        pub fn $setter(&self, value: &str) -> Result<()> {
            self.set_value($path, Value::String(value.to_string()))
        }
    };
}

/// Configuration manager for SpinPlayer
///
/// Loads the embedded defaults, merges the external `config.yaml` on top,
/// applies `SPINPLAYER_CONFIG__...` environment overrides and persists any
/// change made through the typed setters.
#[derive(Debug)]
pub struct Config {
    #[allow(dead_code)]
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Provided directory wins
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Using config dir from env");
            return env_path;
        }

        // 3. Current directory
        if Path::new(".spinplayer").exists() {
            return ".spinplayer".to_string();
        }

        // 4. Home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(".spinplayer");
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        ".spinplayer".to_string()
    }

    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("Config path is not a directory"));
        }

        // Quick write/read permission check
        let probe = path.join(".write_test");
        fs::write(&probe, b"test")?;
        fs::remove_file(&probe)?;
        fs::read_dir(path)?;
        Ok(())
    }

    /// Loads the configuration from the specified directory
    ///
    /// Merges the embedded defaults with the external `config.yaml` if
    /// present, applies environment overrides, then saves the result.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::find_config_dir(directory);
        Self::validate_config_dir(Path::new(&config_dir))?;
        info!(config_dir = %config_dir, "Using config directory");

        let config_file = Path::new(&config_dir).join("config.yaml");
        let path = config_file.to_string_lossy().to_string();

        let mut merged: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        match fs::read(&path) {
            Ok(bytes) => {
                info!(config_file = %path, "Loaded config file");
                let external: Value = serde_yaml::from_slice(&bytes)?;
                merge_yaml(&mut merged, &external);
            }
            Err(_) => {
                info!(config_file = %path, "Config file not found, using embedded defaults");
            }
        }
        let mut merged = lower_keys(merged);
        Self::apply_env_overrides(&mut merged);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(merged),
        };
        config.save()?;
        Ok(config)
    }

    /// Saves the current configuration to its config.yaml file
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the given path and persists it
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data.lock().unwrap();
            set_value_at(&mut data, path, value)?;
        }
        self.save()
    }

    /// Gets a configuration value at the given path
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        let mut current = &*data;
        for (i, key) in path.iter().enumerate() {
            let Value::Mapping(map) = current else {
                return Err(anyhow!("Path {} is not a mapping", path[..i].join(".")));
            };
            current = map
                .get(&Value::String(key.to_lowercase()))
                .ok_or_else(|| anyhow!("Path {} does not exist", path[..=i].join(".")))?;
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, raw) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path: Vec<&str> = stripped.split("__").collect();
                let value = serde_yaml::from_str::<Value>(&raw)
                    .unwrap_or_else(|_| Value::String(raw.clone()));
                let _ = set_value_at(config, &key_path, value);
            }
        }
    }

    // ── Typed accessors ────────────────────────────────────────────────────

    impl_string_config!(get_server_url, set_server_url, &["server", "url"], "");
    impl_string_config!(get_player_name, set_player_name, &["player", "name"], "SpinPlayer");

    impl_f64_config!(
        get_static_delay_ms,
        set_static_delay_ms,
        &["audio", "static_delay_ms"],
        0.0
    );
    impl_f64_config!(
        get_buffer_target_ms,
        set_buffer_target_ms,
        &["audio", "buffer", "target_ms"],
        250.0
    );
    impl_u64_config!(
        get_buffer_capacity_ms,
        set_buffer_capacity_ms,
        &["audio", "buffer", "capacity_ms"],
        8_000
    );

    impl_bool_config!(
        get_wait_for_convergence,
        set_wait_for_convergence,
        &["audio", "clock_sync", "wait_for_convergence"],
        false
    );
    impl_u64_config!(
        get_convergence_timeout_ms,
        set_convergence_timeout_ms,
        &["audio", "clock_sync", "convergence_timeout_ms"],
        5_000
    );
    impl_f64_config!(
        get_forget_factor,
        set_forget_factor,
        &["audio", "clock_sync", "forget_factor"],
        1.05
    );
    impl_f64_config!(
        get_adaptive_cutoff,
        set_adaptive_cutoff,
        &["audio", "clock_sync", "adaptive_cutoff"],
        0.75
    );
    impl_u64_config!(
        get_min_samples_for_forgetting,
        set_min_samples_for_forgetting,
        &["audio", "clock_sync", "min_samples_for_forgetting"],
        100
    );

    impl_u64_config!(
        get_reconnect_base_delay_ms,
        set_reconnect_base_delay_ms,
        &["connection", "reconnect", "base_delay_ms"],
        1_000
    );
    impl_f64_config!(
        get_reconnect_multiplier,
        set_reconnect_multiplier,
        &["connection", "reconnect", "multiplier"],
        1.5
    );
    impl_u64_config!(
        get_reconnect_max_delay_ms,
        set_reconnect_max_delay_ms,
        &["connection", "reconnect", "max_delay_ms"],
        30_000
    );

    impl_string_config!(get_log_level, set_log_level, &["log", "level"], "info");

    /// Stable client identifier, generated and persisted on first access.
    pub fn get_client_id(&self) -> Result<String> {
        let current = match self.get_value(&["player", "client_id"])? {
            Value::String(s) => s,
            _ => String::new(),
        };
        if !current.is_empty() {
            return Ok(current);
        }

        let generated = Uuid::new_v4().to_string();
        info!(client_id = %generated, "Generated new client id");
        self.set_value(&["player", "client_id"], Value::String(generated.clone()))?;
        Ok(generated)
    }
}

/// Deep-merges `overlay` into `base` (mappings recursively, scalars replace).
fn merge_yaml(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

fn set_value_at(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    if path.is_empty() {
        *data = value;
        return Ok(());
    }
    let Value::Mapping(map) = data else {
        return Err(anyhow!("Current node is not a mapping"));
    };
    let key = Value::String(path[0].to_lowercase());
    if path.len() == 1 {
        map.insert(key, value);
        return Ok(());
    }
    let entry = map.entry(key).or_insert(Value::Mapping(Mapping::new()));
    set_value_at(entry, &path[1..], value)
}

/// Lowercases every mapping key, recursively.
fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut lowered = Mapping::new();
            for (key, val) in map {
                let key = match key {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                lowered.insert(key, lower_keys(val));
            }
            Value::Mapping(lowered)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Global configuration singleton.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_loaded() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();

        assert_eq!(config.get_buffer_target_ms().unwrap(), 250.0);
        assert_eq!(config.get_buffer_capacity_ms().unwrap(), 8_000);
        assert_eq!(config.get_static_delay_ms().unwrap(), 0.0);
        assert!(!config.get_wait_for_convergence().unwrap());
        assert_eq!(config.get_reconnect_base_delay_ms().unwrap(), 1_000);
        assert_eq!(config.get_reconnect_multiplier().unwrap(), 1.5);
        assert_eq!(config.get_log_level().unwrap(), "info");
    }

    #[test]
    fn test_set_get_roundtrip_and_persistence() {
        let dir = TempDir::new().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let config = Config::load_config(dir_str).unwrap();
        config.set_static_delay_ms(42.5).unwrap();
        config.set_buffer_capacity_ms(4_000).unwrap();

        // Une relecture depuis le disque voit les valeurs persistées.
        let reloaded = Config::load_config(dir_str).unwrap();
        assert_eq!(reloaded.get_static_delay_ms().unwrap(), 42.5);
        assert_eq!(reloaded.get_buffer_capacity_ms().unwrap(), 4_000);
    }

    #[test]
    fn test_client_id_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let config = Config::load_config(dir_str).unwrap();
        let first = config.get_client_id().unwrap();
        assert!(!first.is_empty());
        assert_eq!(config.get_client_id().unwrap(), first);

        // L'identifiant survit au rechargement.
        let reloaded = Config::load_config(dir_str).unwrap();
        assert_eq!(reloaded.get_client_id().unwrap(), first);
    }

    #[test]
    fn test_external_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "audio:\n  buffer:\n    target_ms: 500.0\n",
        )
        .unwrap();

        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.get_buffer_target_ms().unwrap(), 500.0);
        // Les clés non couvertes gardent leur valeur par défaut.
        assert_eq!(config.get_buffer_capacity_ms().unwrap(), 8_000);
    }

    #[test]
    fn test_env_override() {
        let dir = TempDir::new().unwrap();
        env::set_var("SPINPLAYER_CONFIG__PLAYER__NAME", "Kitchen");
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        env::remove_var("SPINPLAYER_CONFIG__PLAYER__NAME");

        assert_eq!(config.get_player_name().unwrap(), "Kitchen");
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        assert!(config.get_value(&["no", "such", "key"]).is_err());
    }
}
