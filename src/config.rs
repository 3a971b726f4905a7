//! Connection addressing and client-wide tunables (A3).
//!
//! `ConnectionInfo` is the parsed result of a `redis://` URL exactly as the
//! teacher's `load_server_config` parses a config file directive-by-directive
//! into a typed struct, failing fast on the first malformed value rather than
//! silently defaulting it.

use std::time::Duration;

use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::resp::value::encoding::{Charset, UTF8};

/// Where and how to reach one Redis node (§4.4, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub addr: ConnectionAddr,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionAddr {
    Tcp(String, u16),
    Unix(String),
}

impl ConnectionInfo {
    /// Parses a `redis://[user[:pass]@]host[:port][/db]` or
    /// `redis+unix:///path/to/socket` URL.
    ///
    /// This is intentionally narrower than a general-purpose URL parser: it
    /// recognizes exactly the forms Redis clients use and rejects everything
    /// else with `ErrorKind::InvalidData`, per §4.4's "malformed connection
    /// string" edge case.
    pub fn parse(url: &str) -> RedisResult<Self> {
        if let Some(rest) = url.strip_prefix("redis+unix://") {
            return Ok(ConnectionInfo { addr: ConnectionAddr::Unix(rest.to_string()), db: 0, username: None, password: None });
        }
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| invalid_url(url, "missing redis:// scheme"))?;

        let (auth, rest) = match rest.split_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let (username, password) = match auth {
            None => (None, None),
            Some(auth) => match auth.split_once(':') {
                Some((u, p)) => (non_empty(u), non_empty(p)),
                None => (None, non_empty(auth)),
            },
        };

        let (host_port, db) = match rest.split_once('/') {
            Some((hp, db_str)) if !db_str.is_empty() => {
                let db = db_str
                    .parse()
                    .map_err(|_| invalid_url(url, "database index is not an integer"))?;
                (hp, db)
            }
            Some((hp, _)) => (hp, 0),
            None => (rest, 0),
        };
        if host_port.is_empty() {
            return Err(invalid_url(url, "missing host"));
        }
        let (host, port) = match host_port.split_once(':') {
            Some((h, p)) => {
                let port = p.parse().map_err(|_| invalid_url(url, "port is not an integer"))?;
                (h, port)
            }
            None => (host_port, 6379),
        };

        Ok(ConnectionInfo { addr: ConnectionAddr::Tcp(host.to_string(), port), db, username, password })
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn invalid_url(url: &str, reason: &str) -> RedisError {
    RedisError::new(ErrorKind::InvalidData, format!("invalid connection string '{url}': {reason}"))
}

/// Client-wide tunables that apply uniformly across every connection a pool
/// manages (§4.5, §6).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reply_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_size: usize,
    /// Whether `Factory::new` blocks until the pool reaches `pool_size`
    /// (eager) or returns immediately and fills the pool in the background
    /// (lazy), §4.5.
    pub eager_connect: bool,
    /// Enable auto-reconnect on transport loss (§6 `reconnect`/
    /// `continueTrying`, default true). Seeds `Factory`'s `continue_trying`
    /// flag; `Factory::disconnect` can still turn it off afterward.
    pub reconnect: bool,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub convert_numbers: bool,
    /// Text codec applied to bulk replies; `None` means binary passthrough
    /// (§3, §6, §8).
    pub charset: Option<&'static Charset>,
    /// Hash-ring virtual nodes per shard (§6, C7; default 160).
    pub replicas: usize,
    /// Sentinel quorum requirement — minimum number of other Sentinels a
    /// candidate master must be corroborated by (§6, C8).
    pub min_other_sentinels: usize,
    /// Per-operation deadline for Sentinel discovery probes (§6, C8).
    pub discovery_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reply_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            pool_size: 4,
            eager_connect: true,
            reconnect: true,
            reconnect_initial_backoff: Duration::from_millis(50),
            reconnect_max_backoff: Duration::from_secs(10),
            convert_numbers: true,
            charset: Some(&UTF8),
            replicas: 160,
            min_other_sentinels: 0,
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let info = ConnectionInfo::parse("redis://localhost:6380/2").unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".into(), 6380));
        assert_eq!(info.db, 2);
    }

    #[test]
    fn defaults_port_and_db_when_absent() {
        let info = ConnectionInfo::parse("redis://localhost").unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".into(), 6379));
        assert_eq!(info.db, 0);
    }

    #[test]
    fn parses_credentials() {
        let info = ConnectionInfo::parse("redis://user:pw@localhost:6379").unwrap();
        assert_eq!(info.username.as_deref(), Some("user"));
        assert_eq!(info.password.as_deref(), Some("pw"));
    }

    #[test]
    fn parses_password_only_form() {
        let info = ConnectionInfo::parse("redis://:pw@localhost").unwrap();
        assert_eq!(info.username, None);
        assert_eq!(info.password.as_deref(), Some("pw"));
    }

    #[test]
    fn parses_unix_socket_form() {
        let info = ConnectionInfo::parse("redis+unix:///tmp/redis.sock").unwrap();
        assert_eq!(info.addr, ConnectionAddr::Unix("/tmp/redis.sock".into()));
    }

    #[test]
    fn rejects_missing_scheme() {
        let err = ConnectionInfo::parse("localhost:6379").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_non_numeric_db() {
        let err = ConnectionInfo::parse("redis://localhost/notanumber").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
