//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use tm_core::config::{self, DialConfig};

fn config_file(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load the dial configuration.
///
/// An explicitly named file must exist and parse. Without one, the default
/// location is used if present, otherwise built-in defaults.
pub fn resolve_config(config_path: Option<&PathBuf>) -> Result<DialConfig> {
    if let Some(path) = config_path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        tracing::debug!("Using default configuration");
        return Ok(DialConfig::default());
    }

    config::load_config(&default_path)
        .with_context(|| format!("Failed to load config from {:?}", default_path))
}

/// Get a config value by key
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    let path = config_file(config_path);

    if !path.exists() {
        print_error(&format!("Config file not found: {:?}", path));
        print_info("Run 'tunmux config init' to create one");
        return Ok(());
    }

    let table = read_table(&path)?;

    // Navigate through the key path (e.g., "smux.idle_timeout")
    let mut current: &toml::Value = &toml::Value::Table(table);
    for part in key.split('.') {
        match current.as_table().and_then(|t| t.get(part)) {
            Some(value) => current = value,
            None => {
                print_error(&format!("Key not found: {}", key));
                return Ok(());
            }
        }
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Integer(i) => println!("{}", i),
        toml::Value::Float(f) => println!("{}", f),
        toml::Value::Boolean(b) => println!("{}", b),
        toml::Value::Array(a) => {
            for item in a {
                println!("{}", item);
            }
        }
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(current)?),
        toml::Value::Datetime(d) => println!("{}", d),
    }

    Ok(())
}

/// Set a config value by key.
///
/// The edited file must still load as a valid configuration, otherwise it
/// is left untouched.
pub fn config_set(config_path: Option<&PathBuf>, key: &str, value: &str) -> Result<()> {
    let path = config_file(config_path);

    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(config_path, false)?;
    }

    let mut table = read_table(&path)?;

    let parts: Vec<&str> = key.split('.').collect();
    let (last_key, parents) = parts
        .split_last()
        .ok_or_else(|| anyhow::anyhow!("Invalid key: key path cannot be empty"))?;

    let mut current = &mut table;
    for part in parents {
        if !current.contains_key(*part) {
            current.insert(part.to_string(), toml::Value::Table(toml::Table::new()));
        }
        current = current
            .get_mut(*part)
            .and_then(|v| v.as_table_mut())
            .ok_or_else(|| anyhow::anyhow!("Cannot navigate to key: {}", key))?;
    }
    current.insert(last_key.to_string(), parse_value(value));

    let new_content = toml::to_string_pretty(&table)?;
    toml::from_str::<DialConfig>(&new_content)
        .with_context(|| format!("Refusing to write invalid value for {}", key))?;

    std::fs::write(&path, new_content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Show current configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_file(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'tunmux config init' to create one");
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Initialize default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = config_file(config_path);

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
            print_success(&format!("Created config directory: {:?}", dir));
        }
    }

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    std::fs::write(&path, generate_default_config())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| "Failed to parse config file")
}

fn parse_value(value: &str) -> toml::Value {
    if value == "true" {
        toml::Value::Boolean(true)
    } else if value == "false" {
        toml::Value::Boolean(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    }
}

/// Generate default configuration content
fn generate_default_config() -> String {
    r#"# tunmux configuration

# Multiplexing protocol: "smux" (default) or "yamux"
protocol = "smux"

# Upgrade request path
path = "/api/v1/tunnel"

# "wss" for TLS, "ws" for plain internal links
scheme = "wss"

# Per-candidate dial timeout in seconds
per_timeout = 5

# Candidate tunnel endpoints, tried in order
addresses = []

# Initial session rate in bytes/second (omit for unlimited)
# limit_bps = 1048576

[smux]
# Keep-alive interval and idle timeout in seconds, 0 disables
keep_alive_interval = 10
idle_timeout = 30
max_tx_queue = 1024
max_rx_queue = 1024

[yamux]
max_num_streams = 512
split_send_size = 16384
# Inbound streams waiting for accept before new ones are dropped
accept_backlog = 256

[backoff]
# Initial retry delay in seconds
initial = 1
# Maximum retry delay in seconds
max = 60
# Backoff multiplier
multiplier = 2.0
# Jitter factor
jitter = 0.25
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_protocol::Protocol;

    #[test]
    fn test_default_template_matches_defaults() {
        let parsed: DialConfig = toml::from_str(&generate_default_config()).unwrap();
        let defaults = DialConfig::default();
        assert_eq!(parsed.protocol, defaults.protocol);
        assert_eq!(parsed.path, defaults.path);
        assert_eq!(parsed.per_timeout, defaults.per_timeout);
        assert_eq!(parsed.smux, defaults.smux);
        assert_eq!(parsed.yamux, defaults.yamux);
        assert!(parsed.limit_bps.is_none());
    }

    #[test]
    fn test_set_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        config_init(Some(&path), false).unwrap();
        config_set(Some(&path), "protocol", "yamux").unwrap();
        config_set(Some(&path), "yamux.accept_backlog", "32").unwrap();

        let config = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.protocol, Protocol::Yamux);
        assert_eq!(config.yamux.accept_backlog, 32);
    }

    #[test]
    fn test_set_rejects_invalid_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config_init(Some(&path), false).unwrap();

        assert!(config_set(Some(&path), "per_timeout", "soon").is_err());
        let config = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.per_timeout(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(resolve_config(Some(&path)).is_err());
    }
}
