//! The `config` module loads the broker configuration.
//!
//! Sources, lowest precedence first: built-in defaults, `config/default.*`
//! (or an explicit file), then `MSGBROKER_*` environment variables using `__`
//! as the section separator, e.g. `MSGBROKER_BROKER__QUEUE_CAPACITY=10`.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, LogSettings, PersistenceSettings, ServerSettings, Settings, StoreBackend,
};

pub const ENV_PREFIX: &str = "MSGBROKER";

/// Loads the configuration, reading `path` instead of `config/default` when given.
///
/// A `.env` file in the working directory is applied to the environment first.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name("config/default").required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_onto(Settings::default()))
}

#[cfg(test)]
mod tests;
