use std::path::PathBuf;
use std::str::FromStr;

/// The admin account created on an empty store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Server settings, read once from `LABBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Password for anonymous connections, whose user name is not an account.
    /// Accounts always log in with their own password.
    pub token: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub bootstrap_admin: Option<AdminSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            token: "labbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            bootstrap_admin: None,
        }
    }
}

/// Unparseable values read as unset.
fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let bootstrap_admin = match (
            get("LABBOOK_ADMIN_USER"),
            get("LABBOOK_ADMIN_EMAIL"),
            get("LABBOOK_ADMIN_PASSWORD"),
        ) {
            (Some(username), Some(email), Some(password)) => Some(AdminSeed {
                username,
                email,
                password,
            }),
            _ => None,
        };
        Self {
            port: parsed(&get, "LABBOOK_PORT").unwrap_or(defaults.port),
            bind: get("LABBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: get("LABBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            token: get("LABBOOK_TOKEN").unwrap_or(defaults.token),
            max_connections: parsed(&get, "LABBOOK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "LABBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: get("LABBOOK_TLS_CERT"),
            tls_key: get("LABBOOK_TLS_KEY"),
            metrics_port: parsed(&get, "LABBOOK_METRICS_PORT"),
            bootstrap_admin,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labbook.wal")
    }
}
