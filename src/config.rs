use clap::Args;
use std::path::Path;
use std::time::Duration;

use crate::options::{self, DatabaseOption};

pub const DEFAULT_NET: &str = "sqlite";
pub const MEMORY_ADDR: &str = ":memory:";

pub const DEFAULT_MAX_OPEN_CONNS: usize = 50;
pub const DEFAULT_MAX_IDLE_CONNS: usize = 10;
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::ZERO;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::ZERO;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver-level connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    /// Scheme used in the handle id
    pub net: String,
    /// Directory holding the database files, or `:memory:`
    pub addr: String,
    pub db_name: String,
    pub user: String,
    pub passwd: String,
    /// Bounds the startup ping
    pub dial_timeout: Duration,
    /// Bounds each query call, zero disables
    pub read_timeout: Duration,
    /// Bounds each exec call, zero disables
    pub write_timeout: Duration,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            net: DEFAULT_NET.to_string(),
            addr: MEMORY_ADDR.to_string(),
            db_name: String::new(),
            user: String::new(),
            passwd: String::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl ConnParams {
    pub fn is_memory(&self) -> bool {
        self.addr == MEMORY_ADDR
    }

    /// Path or URI the backend opens.
    ///
    /// In-memory databases use a named shared-cache URI so every pooled
    /// connection sees the same data.
    pub fn target(&self) -> String {
        if self.is_memory() {
            format!("file:{}?mode=memory&cache=shared", self.db_name)
        } else {
            Path::new(&self.addr)
                .join(&self.db_name)
                .to_string_lossy()
                .into_owned()
        }
    }

    /// DSN for logs, with the password masked.
    pub fn format_dsn(&self) -> String {
        let mut dsn = String::new();
        if !self.user.is_empty() {
            dsn.push_str(&self.user);
            if !self.passwd.is_empty() {
                dsn.push_str(":***");
            }
            dsn.push('@');
        }
        dsn.push_str(&format!(
            "{}({})/{}?timeout={:?}",
            self.net, self.addr, self.db_name, self.dial_timeout
        ));
        if !self.read_timeout.is_zero() {
            dsn.push_str(&format!("&readTimeout={:?}", self.read_timeout));
        }
        if !self.write_timeout.is_zero() {
            dsn.push_str(&format!("&writeTimeout={:?}", self.write_timeout));
        }
        dsn
    }
}

/// Handle configuration: driver parameters plus pool tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub params: ConnParams,
    /// Zero means unlimited
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
    /// Zero means connections are reused forever
    pub max_lifetime: Duration,
    pub ping_on_startup: bool,
}

impl Config {
    /// Default configuration for one endpoint.
    pub fn new(
        addr: impl Into<String>,
        db_name: impl Into<String>,
        user: impl Into<String>,
        passwd: impl Into<String>,
    ) -> Self {
        Self {
            params: ConnParams {
                addr: addr.into(),
                db_name: db_name.into(),
                user: user.into(),
                passwd: passwd.into(),
                ..ConnParams::default()
            },
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            ping_on_startup: false,
        }
    }

    /// Shared-cache in-memory database named `db_name`.
    pub fn memory(db_name: impl Into<String>) -> Self {
        Self::new(MEMORY_ADDR, db_name, "", "")
    }

    /// Apply options in order; later options overwrite earlier ones.
    pub fn apply<I>(&mut self, opts: I) -> &mut Self
    where
        I: IntoIterator<Item = DatabaseOption>,
    {
        for opt in opts {
            opt(self);
        }
        self
    }

    pub fn with_options<I>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = DatabaseOption>,
    {
        self.apply(opts);
        self
    }

    /// Stable identifier of the endpoint, `net://addr/db_name`.
    pub fn uniq_id(&self) -> String {
        format!("{}://{}/{}", self.params.net, self.params.addr, self.params.db_name)
    }

    pub fn net(&self) -> &str {
        &self.params.net
    }

    pub fn addr(&self) -> &str {
        &self.params.addr
    }

    pub fn db_name(&self) -> &str {
        &self.params.db_name
    }

    pub fn user(&self) -> &str {
        &self.params.user
    }

    pub fn passwd(&self) -> &str {
        &self.params.passwd
    }

    pub fn dial_timeout(&self) -> Duration {
        self.params.dial_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.params.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.params.write_timeout
    }

    pub fn busy_timeout(&self) -> Duration {
        self.params.busy_timeout
    }

    pub fn target(&self) -> String {
        self.params.target()
    }

    pub fn format_dsn(&self) -> String {
        self.params.format_dsn()
    }
}

/// Command line and environment configuration for the `rwsplit` binary.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, default_value = ".", env = "RWSPLIT_DIR", help = "Directory holding the database files (or :memory:)")]
    pub dir: String,

    #[arg(long, default_value = "primary.db", env = "RWSPLIT_PRIMARY", help = "Primary database name")]
    pub primary: String,

    #[arg(long = "replica", env = "RWSPLIT_REPLICAS", value_delimiter = ',', help = "Replica database name, repeatable")]
    pub replicas: Vec<String>,

    #[arg(long, default_value_t = String::new(), env = "RWSPLIT_USER")]
    pub user: String,

    #[arg(long, default_value_t = String::new(), env = "RWSPLIT_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_CONNS, env = "RWSPLIT_MAX_OPEN_CONNS", help = "Maximum open connections per database (0 = unlimited)")]
    pub max_open_conns: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_IDLE_CONNS, env = "RWSPLIT_MAX_IDLE_CONNS")]
    pub max_idle_conns: usize,

    #[arg(long, default_value = "30", env = "RWSPLIT_MAX_LIFETIME_SECONDS", help = "Maximum connection lifetime in seconds (0 = forever)")]
    pub max_lifetime_seconds: u64,

    #[arg(long, default_value = "2000", env = "RWSPLIT_DIAL_TIMEOUT_MS")]
    pub dial_timeout_ms: u64,

    #[arg(long, default_value = "0", env = "RWSPLIT_READ_TIMEOUT_MS")]
    pub read_timeout_ms: u64,

    #[arg(long, default_value = "0", env = "RWSPLIT_WRITE_TIMEOUT_MS")]
    pub write_timeout_ms: u64,

    #[arg(long, env = "RWSPLIT_PING", help = "Ping every database right after opening it")]
    pub ping: bool,
}

impl ClientArgs {
    pub fn options(&self) -> Vec<DatabaseOption> {
        vec![
            options::with_max_open_conns(self.max_open_conns),
            options::with_max_idle_conns(self.max_idle_conns),
            options::with_max_conn_lifetime(Duration::from_secs(self.max_lifetime_seconds)),
            options::with_dial_timeout(Duration::from_millis(self.dial_timeout_ms)),
            options::with_read_timeout(Duration::from_millis(self.read_timeout_ms)),
            options::with_write_timeout(Duration::from_millis(self.write_timeout_ms)),
            options::with_ping_on_startup(self.ping),
        ]
    }

    fn config_for(&self, db_name: &str) -> Config {
        Config::new(&self.dir, db_name, &self.user, &self.password).with_options(self.options())
    }

    pub fn primary_config(&self) -> Config {
        self.config_for(&self.primary)
    }

    pub fn replica_configs(&self) -> Vec<Config> {
        self.replicas.iter().map(|name| self.config_for(name)).collect()
    }
}
