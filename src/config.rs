//! Configuration types.
//!
//! Every section has a `Default` and is built from `GATEWAY_*` environment
//! variables. Unparseable values fall back to the default with a warning.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers kept alive at all times.
    pub worker_count: usize,
    /// Jobs a single worker may run concurrently.
    pub tasks_per_worker: usize,
    /// How long `WorkerPool::shutdown` waits for workers to finish in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            tasks_per_worker: 5,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Secure listener, enabled when both cert and key paths are set.
    pub tls: Option<TlsConfig>,
    /// Idle time after a response before a keep-alive connection is closed.
    /// Kept above typical upstream proxy timeouts.
    pub keep_alive_timeout: Duration,
    /// Time allowed between the first byte of a request and its dispatch.
    pub headers_timeout: Duration,
}

impl ListenerConfig {
    pub fn plain_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 10000,
            tls: None,
            keep_alive_timeout: Duration::from_secs(61),
            headers_timeout: Duration::from_secs(62),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound on the connection drain.
    pub timeout: Duration,
    /// Interval between registry checks while draining.
    pub poll_interval: Duration,
    /// Destroy connections still open when the drain times out.
    pub force_close_on_timeout: bool,
    /// How long to wait for listeners to report closed.
    pub listener_close_timeout: Duration,
}

impl ShutdownConfig {
    /// Number of registry polls the drain may perform.
    pub fn max_polls(&self) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        self.timeout.as_millis().div_ceil(poll) as u32
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(250),
            force_close_on_timeout: false,
            listener_close_timeout: Duration::from_secs(5),
        }
    }
}

/// Keyed byte-store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// libSQL file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./data/kv.db")),
        }
    }
}

/// Upstream content source.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://arweave.net".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Periodic resource health check.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Cron expression (with seconds field).
    pub schedule: String,
    /// Filesystem whose free space is checked.
    pub disk_path: PathBuf,
    /// Alert when free space drops below this many bytes.
    pub min_free_bytes: u64,
    /// Page on critical load instead of only pinging.
    pub high_load_critical: bool,
    /// 1-minute load average per CPU, in percent.
    pub load: Thresholds,
    /// Memory in use, in percent.
    pub memory: Thresholds,
}

/// Percent levels at which a resource alert is raised. Each level is
/// inclusive and implies the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Report without mentioning anyone.
    pub notice: u64,
    /// Mention the on-call id.
    pub ping: u64,
    /// Page.
    pub critical: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            schedule: "0 */5 * * * *".to_string(),
            disk_path: PathBuf::from("/"),
            min_free_bytes: 10 * 1024 * 1024 * 1024,
            high_load_critical: false,
            load: Thresholds {
                notice: 50,
                ping: 75,
                critical: 200,
            },
            memory: Thresholds {
                notice: 50,
                ping: 75,
                critical: 90,
            },
        }
    }
}

/// Outbound notification targets.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub node_name: String,
    pub webhook_url: Option<SecretString>,
    pub pagerduty_routing_key: Option<SecretString>,
    /// Mention added to pinged messages.
    pub ping_id: Option<String>,
    /// PagerDuty events v2 endpoint.
    pub pagerduty_url: String,
    pub max_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_base_delay: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            node_name: "gateway".to_string(),
            webhook_url: None,
            pagerduty_routing_key: None,
            ping_id: None,
            pagerduty_url: "https://events.pagerduty.com/v2/enqueue".to_string(),
            max_retries: 10,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Process-manager integration.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Read control messages (`shutdown`) from stdin.
    pub stdin_control: bool,
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub listener: ListenerConfig,
    pub shutdown: ShutdownConfig,
    pub pool: PoolConfig,
    pub store: StoreConfig,
    pub upstream: UpstreamConfig,
    pub health: HealthConfig,
    pub webhook: WebhookConfig,
    pub supervisor: SupervisorConfig,
}

impl GatewayConfig {
    /// Directory for rolling log files. Read separately so logging can be
    /// set up before the rest of the config is parsed.
    pub const LOG_DIR_VAR: &'static str = "GATEWAY_LOG_DIR";

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Self::default();

        let tls = match (vars.get("GATEWAY_TLS_CERT"), vars.get("GATEWAY_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                port: vars.parse("GATEWAY_TLS_PORT", 10443),
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            _ => {
                tracing::warn!("GATEWAY_TLS_CERT and GATEWAY_TLS_KEY must both be set; TLS disabled");
                None
            }
        };

        let listener = ListenerConfig {
            host: vars.parse("GATEWAY_HOST", defaults.listener.host),
            port: vars.parse("PORT", defaults.listener.port),
            tls,
            keep_alive_timeout: vars.millis(
                "GATEWAY_KEEP_ALIVE_TIMEOUT_MS",
                defaults.listener.keep_alive_timeout,
            ),
            headers_timeout: vars.millis(
                "GATEWAY_HEADERS_TIMEOUT_MS",
                defaults.listener.headers_timeout,
            ),
        };

        let shutdown = ShutdownConfig {
            timeout: vars.millis("GATEWAY_SHUTDOWN_TIMEOUT_MS", defaults.shutdown.timeout),
            force_close_on_timeout: vars.parse(
                "GATEWAY_SHUTDOWN_FORCE_CLOSE",
                defaults.shutdown.force_close_on_timeout,
            ),
            ..defaults.shutdown
        };

        let pool = PoolConfig {
            worker_count: vars
                .parse("GATEWAY_WORKER_COUNT", defaults.pool.worker_count)
                .max(1),
            tasks_per_worker: vars
                .parse("GATEWAY_TASKS_PER_WORKER", defaults.pool.tasks_per_worker)
                .max(1),
            shutdown_timeout: vars.millis(
                "GATEWAY_POOL_SHUTDOWN_TIMEOUT_MS",
                defaults.pool.shutdown_timeout,
            ),
        };

        let store = StoreConfig {
            path: match vars.get("GATEWAY_KV_PATH").as_deref() {
                Some(":memory:") => None,
                Some(path) => Some(PathBuf::from(path)),
                None => defaults.store.path,
            },
        };

        let upstream = UpstreamConfig {
            base_url: vars
                .get("GATEWAY_TRUSTED_URL")
                .unwrap_or(defaults.upstream.base_url),
            request_timeout: vars.millis(
                "GATEWAY_UPSTREAM_TIMEOUT_MS",
                defaults.upstream.request_timeout,
            ),
        };

        let health = HealthConfig {
            schedule: vars
                .get("GATEWAY_HEALTHCHECK_CRON")
                .unwrap_or(defaults.health.schedule),
            disk_path: vars
                .get("GATEWAY_HEALTHCHECK_DISK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.health.disk_path),
            min_free_bytes: vars.parse("FS_FREE_SPACE_MIN", defaults.health.min_free_bytes),
            high_load_critical: vars.parse(
                "HIGH_LOAD_CRITICAL",
                defaults.health.high_load_critical,
            ),
            ..defaults.health
        };

        let webhook = WebhookConfig {
            node_name: vars.get("NODE_NAME").unwrap_or(defaults.webhook.node_name),
            webhook_url: vars.get("WEBHOOK_URL").map(SecretString::from),
            pagerduty_routing_key: vars.get("PDUTY_ROUTING_KEY").map(SecretString::from),
            ping_id: vars.get("PING_ID"),
            pagerduty_url: vars
                .get("PDUTY_EVENTS_URL")
                .unwrap_or(defaults.webhook.pagerduty_url),
            max_retries: vars.parse("WEBHOOK_MAX_RETRIES", defaults.webhook.max_retries),
            retry_base_delay: vars.millis(
                "WEBHOOK_RETRY_BASE_MS",
                defaults.webhook.retry_base_delay,
            ),
        };

        let supervisor = SupervisorConfig {
            stdin_control: vars.parse("GATEWAY_STDIN_CONTROL", false),
        };

        Self {
            listener,
            shutdown,
            pool,
            store,
            upstream,
            health,
            webhook,
            supervisor,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(key, value = %raw, "Invalid configuration value ({e}), using default");
                default
            }),
            None => default,
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64))
    }
}
