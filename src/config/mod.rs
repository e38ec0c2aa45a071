// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{default_config_path, load_config, load_config_from, load_settings, resolve_config};
pub use settings::{BackendSettings, BuildConfig, Config, EnvelopeConfig, OracleConfig, StoreConfig};
