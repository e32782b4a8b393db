//! Configuration loading for a broker node.
//!
//! Values come from an optional `config/default.*` file and from
//! `MESHSUB__<SECTION>__<KEY>` environment variables, merged over
//! `Settings::default()`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, DirectorySettings, LoggingSettings, ServerSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// and merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MESHSUB")
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial))
}

fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();
    let server = partial.server;
    let broker = partial.broker;
    let directory = partial.directory;
    let logging = partial.logging;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: BrokerSettings {
            total_pub_limit: broker
                .as_ref()
                .and_then(|b| b.total_pub_limit)
                .unwrap_or(default.broker.total_pub_limit),
            total_sub_limit: broker
                .as_ref()
                .and_then(|b| b.total_sub_limit)
                .unwrap_or(default.broker.total_sub_limit),
            admission_timeout_ms: broker
                .as_ref()
                .and_then(|b| b.admission_timeout_ms)
                .unwrap_or(default.broker.admission_timeout_ms),
            handshake_timeout_ms: broker
                .as_ref()
                .and_then(|b| b.handshake_timeout_ms)
                .unwrap_or(default.broker.handshake_timeout_ms),
        },
        directory: DirectorySettings {
            address: directory
                .as_ref()
                .and_then(|d| d.address.clone())
                .or(default.directory.address),
            refresh_interval_secs: directory
                .as_ref()
                .and_then(|d| d.refresh_interval_secs)
                .unwrap_or(default.directory.refresh_interval_secs),
            dial_backoff_secs: directory
                .as_ref()
                .and_then(|d| d.dial_backoff_secs)
                .unwrap_or(default.directory.dial_backoff_secs),
        },
        logging: LoggingSettings {
            level: logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    }
}
