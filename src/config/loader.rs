// Configuration loader
// Loads settings from ~/.appweaver/config.toml, falling back to GEMINI_API_KEY

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::Config;

const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Load configuration and require an oracle API key
pub fn load_config() -> Result<Config> {
    resolve_config(None, true)
}

/// Load configuration from the default location or the environment.
///
/// The API key may be empty; commands that never call the oracle use this.
pub fn load_settings() -> Result<Config> {
    resolve_config(None, false)
}

/// Load `path` (or the default file when present), fill the API key from
/// the environment when the file has none, and optionally require one.
pub fn resolve_config(path: Option<&Path>, require_key: bool) -> Result<Config> {
    let (source, config) = match path {
        Some(path) => (path.to_path_buf(), load_config_from(path)?),
        None => {
            let default = default_config_path()?;
            let config = if default.exists() {
                load_config_from(&default)?
            } else {
                Config::default()
            };
            (default, config)
        }
    };

    let config = with_env_key(config, std::env::var(API_KEY_ENV).ok());
    if require_key {
        ensure_api_key(&config, &source)?;
    }
    Ok(config)
}

fn with_env_key(mut config: Config, env_key: Option<String>) -> Config {
    if config.oracle.api_key.is_empty() {
        if let Some(api_key) = env_key.filter(|k| !k.trim().is_empty()) {
            config.oracle.api_key = api_key;
        }
    }
    config
}

fn ensure_api_key(config: &Config, source: &Path) -> Result<()> {
    if config.oracle.api_key.trim().is_empty() {
        bail!(
            "No oracle API key configured.\n\n\
             Add it to {}:\n\n\
             [oracle]\n\
             api_key = \"...\"\n\n\
             or set the environment variable:\n\
             export {}=\"...\"",
            source.display(),
            API_KEY_ENV
        );
    }
    Ok(())
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".appweaver/config.toml"))
}

/// Load and validate a specific config file
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .context("Configuration validation failed")?;

    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[oracle]\napi_key = \"abc\"\nmodel = \"gemini-pro\"\n\n[build]\nmax_code_attempts = 4\n"
        )
        .unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.oracle.api_key, "abc");
        assert_eq!(config.oracle.model, "gemini-pro");
        assert_eq!(config.build.max_code_attempts, 4);
        assert_eq!(config.build.history_window, 5);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[envelope]\ntimeout_secs = 0\n").unwrap();
        assert!(load_config_from(file.path()).is_err());
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[oracle\napi_key = ").unwrap();
        let err = load_config_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_env_key_fills_only_missing_key() {
        let filled = with_env_key(Config::default(), Some("from-env".into()));
        assert_eq!(filled.oracle.api_key, "from-env");

        let mut config = Config::default();
        config.oracle.api_key = "from-file".into();
        let kept = with_env_key(config, Some("from-env".into()));
        assert_eq!(kept.oracle.api_key, "from-file");
    }

    #[test]
    fn test_missing_key_names_the_explicit_file() {
        let path = Path::new("/etc/appweaver/custom.toml");
        let err = ensure_api_key(&Config::default(), path).unwrap_err();
        assert!(err.to_string().contains("/etc/appweaver/custom.toml"));
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn test_explicit_file_with_key_satisfies_requirement() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[oracle]\napi_key = \"file-key\"\n").unwrap();
        let config = resolve_config(Some(file.path()), true).unwrap();
        assert_eq!(config.oracle.api_key, "file-key");
    }
}
