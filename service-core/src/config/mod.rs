use crate::error::AppError;
use config::{Config as Cfg, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::de::DeserializeOwned;

/// Prefix for environment overrides, e.g. `APP__DATABASE__HOST`.
pub const ENV_PREFIX: &str = "APP";

/// Load layered settings: defaults supplied by the caller, then an optional
/// `configuration.{yaml,toml,json}` file, then `APP__`-prefixed environment
/// variables (a `.env` file is read first if present).
pub fn load<T, F>(defaults: F) -> Result<T, AppError>
where
    T: DeserializeOwned,
    F: FnOnce(ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, ConfigError>,
{
    dotenvy::dotenv().ok();

    let config = defaults(Cfg::builder())?
        .add_source(File::with_name("configuration").required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}
