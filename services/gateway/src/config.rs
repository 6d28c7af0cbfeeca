use quark::crypto::{EncryptionMode, SigningIdentity};
use quark::encoding::base64;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tachyon::admission::AdmissionConfig;
use tachyon::pool::buffer::PoolConfig;
use tachyon::runtime::RuntimeConfig;
use tachyon::throttle::LimiterConfig;

pub const DEFAULT_PORT: u16 = 7777;

// Container mount points preferred when present
const CONTAINER_DATA: &str = "/data";
const CONTAINER_LOGS: &str = "/logs";
const CONTAINER_CONFIG: &str = "/config";

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub port: u16,
    pub worker_threads: usize,
    pub machine: u16,
    pub heartbeat_interval_ms: u64,
    pub ingress_timeout_ms: u64,
    pub handler_timeout_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Limits {
    pub max_connections_per_ip: u32,
    pub max_tokens: u32,
    pub refill_interval_ms: u64,
    pub tokens_per_refill: u32,
    pub lockout_seconds: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Buffers {
    pub total_buffers: usize,
    /// Size classes as `size,ratio` pairs separated by semicolons.
    pub buffer_allocations: String,
}

#[derive(Serialize, Deserialize)]
pub struct Security {
    pub encryption_mode: EncryptionMode,
    pub handshake_timeout_ms: u64,
    /// Base64 Ed25519 seed; absent means unsigned handshakes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct Paths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: Server,
    pub limits: Limits,
    pub buffers: Buffers,
    pub security: Security,
    #[serde(default)]
    pub paths: Paths,
}

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            server: Server {
                address: "127.0.0.1".into(),
                port: DEFAULT_PORT,
                worker_threads: 0,
                machine: 0,
                heartbeat_interval_ms: 3000,
                ingress_timeout_ms: 30_000,
                handler_timeout_ms: 0,
            },
            limits: Limits {
                max_connections_per_ip: 32,
                max_tokens: 64,
                refill_interval_ms: 1000,
                tokens_per_refill: 64,
                lockout_seconds: 30,
            },
            buffers: Buffers {
                total_buffers: 1024,
                buffer_allocations:
                    "256,0.40;512,0.25;1024,0.15;2048,0.10;4096,0.05;8192,0.03;16384,0.02".into(),
            },
            security: Security {
                encryption_mode: EncryptionMode::None,
                handshake_timeout_ms: 5000,
                signing_key: None,
            },
            paths: Paths::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
        serdeconv::from_toml_file(path).map_err(|err| ConfigError(err.to_string()))
    }

    /// Prefers the conventional container mount points for any directory
    /// the file leaves unset.
    pub fn resolve_paths(&mut self) {
        if self.paths.data_path.is_none() && Path::new(CONTAINER_DATA).is_dir() {
            self.paths.data_path = Some(CONTAINER_DATA.into());
        }

        if self.paths.logs_path.is_none() && Path::new(CONTAINER_LOGS).is_dir() {
            self.paths.logs_path = Some(CONTAINER_LOGS.into());
        }

        if self.paths.config_path.is_none() && Path::new(CONTAINER_CONFIG).is_dir() {
            self.paths.config_path = Some(CONTAINER_CONFIG.into());
        }
    }

    /// Directory searched for config files: explicit path, container
    /// mount, or the working directory.
    pub fn default_config_dir() -> PathBuf {
        if Path::new(CONTAINER_CONFIG).is_dir() {
            PathBuf::from(CONTAINER_CONFIG)
        } else {
            PathBuf::from(".")
        }
    }

    /// Converts the file surface into the runtime's configuration.
    pub fn runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
        let allocations = parse_allocations(&self.buffers.buffer_allocations)?;

        Ok(RuntimeConfig {
            server_address: self.server.address.clone(),
            port: self.server.port,
            admission: AdmissionConfig {
                max_connections_per_ip: self.limits.max_connections_per_ip,
            },
            pool: PoolConfig {
                total_buffers: self.buffers.total_buffers,
                allocations,
            },
            limiter: LimiterConfig {
                max_tokens: self.limits.max_tokens,
                refill_interval: Duration::from_millis(self.limits.refill_interval_ms),
                tokens_per_refill: self.limits.tokens_per_refill,
                lockout: match self.limits.lockout_seconds {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                lockout_threshold: 32,
                lockout_window: Duration::from_secs(10),
            },
            encryption_mode: self.security.encryption_mode,
            handshake_timeout: Duration::from_millis(self.security.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.server.heartbeat_interval_ms),
            ingress_timeout: Duration::from_millis(self.server.ingress_timeout_ms),
            worker_threads: self.server.worker_threads,
            default_handler_timeout: match self.server.handler_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            machine: self.server.machine,
        })
    }

    /// Decodes the configured signing identity, if any.
    pub fn signing_identity(&self) -> Result<Option<SigningIdentity>, ConfigError> {
        let encoded = match &self.security.signing_key {
            Some(encoded) => encoded,
            None => return Ok(None),
        };

        let decoded = base64::decode(encoded)
            .map_err(|err| ConfigError(format!("signing_key is not valid Base64: {}", err)))?;

        if decoded.len() != 32 {
            return Err(ConfigError(format!(
                "signing_key must decode to 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&decoded);

        Ok(Some(SigningIdentity::from_bytes(&seed)))
    }
}

/// Parses the `size,ratio;...` buffer allocation table.
pub fn parse_allocations(table: &str) -> Result<Vec<(usize, f64)>, ConfigError> {
    let mut allocations = Vec::new();

    for entry in table.split(';').filter(|entry| !entry.trim().is_empty()) {
        let mut fields = entry.split(',');

        let size = fields
            .next()
            .and_then(|field| field.trim().parse::<usize>().ok())
            .ok_or_else(|| ConfigError(format!("bad buffer size in `{}`", entry)))?;

        let ratio = fields
            .next()
            .and_then(|field| field.trim().parse::<f64>().ok())
            .ok_or_else(|| ConfigError(format!("bad buffer ratio in `{}`", entry)))?;

        if fields.next().is_some() {
            return Err(ConfigError(format!("trailing fields in `{}`", entry)));
        }

        if size == 0 || !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError(format!("allocation out of range in `{}`", entry)));
        }

        allocations.push((size, ratio));
    }

    if allocations.is_empty() {
        return Err(ConfigError("buffer_allocations is empty".into()));
    }

    let total: f64 = allocations.iter().map(|&(_, ratio)| ratio).sum();
    if total > 1.0 + 1e-9 {
        return Err(ConfigError(format!(
            "buffer allocation ratios sum to {}, must be <= 1.0",
            total
        )));
    }

    Ok(allocations)
}
