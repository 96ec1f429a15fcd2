use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_PORT_RANGE_START: u16 = 18100;
const DEFAULT_PORT_RANGE_END: u16 = 18199;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEV_JWT_SECRET: &str = "dev-insecure-change-me";
const DEV_MASTER_SECRET: &str = "dev-insecure-master-secret";

/// Process-wide settings, read once at boot.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub data_root: PathBuf,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub instance_command: String,
    pub instance_args: Vec<String>,
    pub health_path: String,
    pub env_prefix: String,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub max_auto_restarts: u32,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub port_conflict_retries: u32,
    pub master_secret: String,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub log_max_lines: usize,
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_u16(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u16> {
    lookup(name).and_then(|v| v.trim().parse::<u16>().ok())
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Duration {
    Duration::from_secs(
        parse_u64(lookup, name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default),
    )
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen_addr: SocketAddr = non_empty(&lookup, "HIVE_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HIVE_LISTEN_ADDR: {e}"))?;

        let data_root = PathBuf::from(
            non_empty(&lookup, "HIVE_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        );
        let database_url = non_empty(&lookup, "DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite://{}?mode=rwc", data_root.join("hive.db").display())
        });

        let port_range_start =
            parse_u16(&lookup, "HIVE_PORT_RANGE_START").unwrap_or(DEFAULT_PORT_RANGE_START);
        let port_range_end =
            parse_u16(&lookup, "HIVE_PORT_RANGE_END").unwrap_or(DEFAULT_PORT_RANGE_END);
        if port_range_start == 0 || port_range_end < port_range_start {
            anyhow::bail!("invalid port range: {port_range_start}-{port_range_end}");
        }

        let instance_args = lookup("HIVE_INSTANCE_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let mut health_path = non_empty(&lookup, "HIVE_INSTANCE_HEALTH_PATH")
            .unwrap_or_else(|| "/api/health".to_string());
        if !health_path.starts_with('/') {
            health_path.insert(0, '/');
        }

        let env_prefix = non_empty(&lookup, "HIVE_INSTANCE_ENV_PREFIX")
            .unwrap_or_else(|| "INSTANCE".to_string())
            .to_ascii_uppercase();

        let restart_backoff = Duration::from_millis(
            parse_u64(&lookup, "HIVE_RESTART_BACKOFF_MS")
                .map(|v| v.clamp(0, 10 * 60 * 1000))
                .unwrap_or(1000),
        );
        let restart_backoff_max = Duration::from_millis(
            parse_u64(&lookup, "HIVE_RESTART_BACKOFF_MAX_MS")
                .map(|v| v.clamp(restart_backoff.as_millis() as u64, 60 * 60 * 1000))
                .unwrap_or(30_000)
                .max(restart_backoff.as_millis() as u64),
        );

        let dev = lookup("HIVE_DEV").is_some_and(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        });
        let master_secret = match non_empty(&lookup, "HIVE_MASTER_SECRET") {
            Some(v) => v,
            None if dev => {
                tracing::warn!(
                    "HIVE_MASTER_SECRET is not set; agent credentials use an insecure development key"
                );
                DEV_MASTER_SECRET.to_string()
            }
            None => anyhow::bail!("HIVE_MASTER_SECRET is required (set HIVE_DEV=1 for local development)"),
        };
        let jwt_secret = match non_empty(&lookup, "HIVE_JWT_SECRET") {
            Some(v) => v,
            None if dev => DEV_JWT_SECRET.to_string(),
            None => anyhow::bail!("HIVE_JWT_SECRET is required (set HIVE_DEV=1 for local development)"),
        };

        // Production should set `HIVE_ALLOWED_ORIGINS` explicitly.
        let allowed_origins = lookup("HIVE_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173,http://127.0.0.1:5173".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            listen_addr,
            database_url,
            data_root,
            port_range_start,
            port_range_end,
            instance_command: non_empty(&lookup, "HIVE_INSTANCE_COMMAND")
                .unwrap_or_else(|| "instance-server".to_string()),
            instance_args,
            health_path,
            env_prefix,
            start_timeout: secs(&lookup, "HIVE_START_TIMEOUT_SEC", 60, 1, 600),
            stop_timeout: secs(&lookup, "HIVE_STOP_TIMEOUT_SEC", 30, 1, 300),
            health_interval: secs(&lookup, "HIVE_HEALTH_INTERVAL_SEC", 10, 1, 3600),
            probe_timeout: secs(&lookup, "HIVE_HEALTH_PROBE_TIMEOUT_SEC", 5, 1, 60),
            failure_threshold: parse_u64(&lookup, "HIVE_HEALTH_FAILURE_THRESHOLD")
                .map(|v| v.clamp(1, 100) as u32)
                .unwrap_or(3),
            max_auto_restarts: parse_u64(&lookup, "HIVE_MAX_AUTO_RESTARTS")
                .map(|v| v.clamp(0, 100) as u32)
                .unwrap_or(3),
            restart_backoff,
            restart_backoff_max,
            port_conflict_retries: parse_u64(&lookup, "HIVE_PORT_CONFLICT_RETRIES")
                .map(|v| v.clamp(0, 50) as u32)
                .unwrap_or(3),
            master_secret,
            jwt_secret,
            allowed_origins,
            log_max_lines: parse_u64(&lookup, "HIVE_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000) as usize)
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
        })
    }

    pub fn port_range_len(&self) -> usize {
        usize::from(self.port_range_end - self.port_range_start) + 1
    }

    /// Delay before the `attempt`-th (1-based) consecutive auto-restart.
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        let ms = (self.restart_backoff.as_millis() as u64)
            .saturating_mul(mult)
            .min(self.restart_backoff_max.as_millis() as u64);
        Duration::from_millis(ms)
    }
}
