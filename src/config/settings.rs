use serde::Deserialize;

/// Top-level configuration settings for a broker node.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub directory: DirectorySettings,
    pub logging: LoggingSettings,
}

/// Address the broker listens on. `host:port` is also the address it
/// advertises to the directory and to peers.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Mesh-wide admission limits and protocol timeouts.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub total_pub_limit: usize,
    pub total_sub_limit: usize,
    pub admission_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

/// Where to find the broker directory. Without an address the node runs
/// standalone and only links with peers that dial it.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectorySettings {
    pub address: Option<String>,
    pub refresh_interval_secs: u64,
    /// How long a listed broker that could not be dialed is skipped.
    pub dial_backoff_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub directory: Option<PartialDirectorySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub total_pub_limit: Option<usize>,
    pub total_sub_limit: Option<usize>,
    pub admission_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDirectorySettings {
    pub address: Option<String>,
    pub refresh_interval_secs: Option<u64>,
    pub dial_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Settings {
    /// The `host:port` string this node is known by in the mesh.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                total_pub_limit: 5,
                total_sub_limit: 10,
                admission_timeout_ms: 5000,
                handshake_timeout_ms: 10_000,
            },
            directory: DirectorySettings {
                address: None,
                refresh_interval_secs: 5,
                dial_backoff_secs: 30,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
