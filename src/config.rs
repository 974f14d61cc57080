use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once at startup from `TABLEBOOK_*` environment
/// variables. Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Prometheus exporter port; `None` disables it.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            user: "staff".into(),
            password: "tablebook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

/// `None` when the variable is unset or does not parse as `T`.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "TABLEBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("TABLEBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("TABLEBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            user: lookup("TABLEBOOK_USER").unwrap_or(defaults.user),
            password: lookup("TABLEBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "TABLEBOOK_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "TABLEBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "TABLEBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|p| ([0, 0, 0, 0], p).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.metrics_addr(), None);
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("TABLEBOOK_PORT", "6543"),
            ("TABLEBOOK_BIND", "127.0.0.1"),
            ("TABLEBOOK_DATA_DIR", "/var/lib/tablebook"),
            ("TABLEBOOK_USER", "host"),
            ("TABLEBOOK_PASSWORD", "s3cret"),
            ("TABLEBOOK_MAX_CONNECTIONS", "16"),
            ("TABLEBOOK_COMPACT_THRESHOLD", "50"),
            ("TABLEBOOK_METRICS_PORT", "9000"),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:6543");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/tablebook"));
        assert_eq!((c.user.as_str(), c.password.as_str()), ("host", "s3cret"));
        assert_eq!(c.max_connections, 16);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.metrics_addr().map(|a| a.port()), Some(9000));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let c = config(&[
            ("TABLEBOOK_PORT", "eighty"),
            ("TABLEBOOK_MAX_CONNECTIONS", "0"),
            ("TABLEBOOK_COMPACT_THRESHOLD", "-5"),
            ("TABLEBOOK_METRICS_PORT", "-1"),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
    }

    #[test]
    fn numbers_parse_per_field_type() {
        // 70000 fits a connection count but not a port.
        let c = config(&[
            ("TABLEBOOK_PORT", "70000"),
            ("TABLEBOOK_MAX_CONNECTIONS", "70000"),
            ("TABLEBOOK_COMPACT_THRESHOLD", " 5000000000 "),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, 70_000);
        assert_eq!(c.compact_threshold, 5_000_000_000);
    }
}
