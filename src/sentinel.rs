//! Sentinel client (C8, §4.8): resolves a named service's current master
//! (and slaves) from a set of Sentinel endpoints, and keeps a [`Factory`]
//! pointed at the live master by watching for address changes.
//!
//! There's no Sentinel analog in the connection core this crate grew out of,
//! so this module leans on the same scatter-gather shape the sharder (§4.7)
//! uses for `MGET`: probe every Sentinel concurrently, then fold the
//! responses down to one answer.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, instrument, warn};

use crate::config::{ClientConfig, ConnectionAddr, ConnectionInfo};
use crate::connection::Connection;
use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::pool::Factory;
use crate::resp::{Cmd, Value};

const DOWN_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// A set of Sentinel endpoints watching one named service (§3 `Sentinel Pool`).
#[derive(Clone)]
pub struct SentinelClient {
    sentinels: Vec<ConnectionInfo>,
    service_name: String,
    min_other_sentinels: usize,
    discovery_timeout: Duration,
}

impl SentinelClient {
    pub fn new(sentinels: Vec<ConnectionInfo>, service_name: impl Into<String>, min_other_sentinels: usize, discovery_timeout: Duration) -> Self {
        SentinelClient { sentinels, service_name: service_name.into(), min_other_sentinels, discovery_timeout }
    }

    /// Queries every Sentinel in parallel with `SENTINEL MASTERS`, keeps the
    /// quorum-acceptable candidates, and returns the address reported by the
    /// most Sentinels, ties broken by whichever address was observed first
    /// (§4.8 step 1).
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn discover_master(&self) -> RedisResult<ConnectionAddr> {
        let probes = self.sentinels.iter().map(|sentinel| {
            probe_master(sentinel, &self.service_name, self.min_other_sentinels, self.discovery_timeout)
        });
        let candidates: Vec<ConnectionAddr> = join_all(probes).await.into_iter().flatten().collect();
        majority_vote(candidates).ok_or_else(|| {
            RedisError::new(ErrorKind::MasterNotFound, format!("no sentinel reported a quorum-acceptable master for '{}'", self.service_name))
        })
    }

    /// Queries every Sentinel in parallel with `SENTINEL SLAVES`, unions the
    /// addresses not flagged down, falling back to the master's address when
    /// the union is empty (§4.8 step 2).
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn discover_slaves(&self) -> RedisResult<Vec<ConnectionAddr>> {
        let probes = self.sentinels.iter().map(|sentinel| {
            probe_slaves(sentinel, &self.service_name, self.discovery_timeout)
        });
        let mut seen = Vec::new();
        for addrs in join_all(probes).await {
            for addr in addrs {
                if !seen.contains(&addr) {
                    seen.push(addr);
                }
            }
        }
        if seen.is_empty() {
            seen.push(self.discover_master().await?);
        }
        Ok(seen)
    }

    /// Spawns the reconfiguration loop (§4.8 step 4): every `interval`,
    /// re-runs discovery and, if the master address changed, role-verifies
    /// it and hands it to `factory.replace_endpoint`. `base_info` supplies
    /// the `db`/credentials to reuse for the new address; only the address
    /// itself varies across reconfigurations.
    pub fn watch(&self, factory: Factory, base_info: ConnectionInfo, interval: Duration) -> tokio::task::JoinHandle<()> {
        let sentinel = self.clone();
        tokio::spawn(async move {
            let mut current = base_info.addr.clone();
            loop {
                tokio::time::sleep(interval).await;
                match sentinel.discover_master().await {
                    Ok(addr) if addr != current => {
                        if let Err(err) = sentinel.verify_role(&addr, "master").await {
                            warn!(error = %err, ?addr, "discovered master failed role verification, skipping failover");
                            continue;
                        }
                        info!(old = ?current, new = ?addr, "sentinel reports master address change");
                        let mut next_info = base_info.clone();
                        next_info.addr = addr.clone();
                        if let Err(err) = factory.replace_endpoint(next_info).await {
                            warn!(error = %err, "failed to reconnect factory to new master");
                            continue;
                        }
                        current = addr;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "sentinel reconfiguration discovery failed"),
                }
            }
        })
    }

    /// Connects to `addr` and issues `ROLE`, failing unless the reported
    /// role matches `expected` (`"master"` or `"slave"`). Defends against
    /// acting on a stale Sentinel reply (§4.8 step 3).
    #[instrument(skip(self))]
    pub async fn verify_role(&self, addr: &ConnectionAddr, expected: &str) -> RedisResult<()> {
        let info = ConnectionInfo { addr: addr.clone(), db: 0, username: None, password: None };
        let config =
            ClientConfig { connect_timeout: self.discovery_timeout, pool_size: 1, eager_connect: true, convert_numbers: false, ..Default::default() };
        let conn = Connection::connect(&info, &config).await?;
        let reply = conn.execute_command(&Cmd::new("ROLE")).await;
        conn.disconnect().await;
        match reply? {
            Value::Array(items) => match items.first().and_then(Value::as_str) {
                Some(role) if role.eq_ignore_ascii_case(expected) => Ok(()),
                Some(role) => Err(RedisError::new(
                    ErrorKind::MasterNotFound,
                    format!("expected role '{expected}', node reported '{role}'"),
                )),
                None => Err(RedisError::new(ErrorKind::InvalidResponse, "ROLE reply had no role element")),
            },
            other => Err(RedisError::new(ErrorKind::InvalidResponse, format!("ROLE returned {other:?}"))),
        }
    }
}

/// Connects to one Sentinel, issues `SENTINEL MASTERS`, and returns the
/// address of `service` if it passes the quorum filter. Connection or
/// protocol failures on a single Sentinel are logged and treated as "no
/// opinion" rather than failing the whole discovery round.
async fn probe_master(sentinel: &ConnectionInfo, service: &str, min_other_sentinels: usize, timeout: Duration) -> Option<ConnectionAddr> {
    let reply = query_sentinel(sentinel, Cmd::new("SENTINEL").arg("MASTERS"), timeout).await?;
    let records = match reply {
        Value::Array(records) => records,
        _ => return None,
    };
    records.into_iter().find_map(|record| {
        let Value::Array(fields) = record else { return None };
        let fields = field_map(&fields);
        if fields.get("name").map(String::as_str) != Some(service) {
            return None;
        }
        if is_down(&fields) {
            return None;
        }
        let other_sentinels: usize = fields.get("num-other-sentinels").and_then(|s| s.parse().ok()).unwrap_or(0);
        if other_sentinels < min_other_sentinels {
            return None;
        }
        addr_from_fields(&fields)
    })
}

/// Connects to one Sentinel and unions the non-down slave addresses for
/// `service` it reports.
async fn probe_slaves(sentinel: &ConnectionInfo, service: &str, timeout: Duration) -> Vec<ConnectionAddr> {
    let Some(reply) = query_sentinel(sentinel, Cmd::new("SENTINEL").arg("SLAVES").arg(service), timeout).await else {
        return Vec::new();
    };
    let Value::Array(records) = reply else { return Vec::new() };
    records
        .into_iter()
        .filter_map(|record| {
            let Value::Array(fields) = record else { return None };
            let fields = field_map(&fields);
            if is_down(&fields) {
                return None;
            }
            addr_from_fields(&fields)
        })
        .collect()
}

async fn query_sentinel(sentinel: &ConnectionInfo, cmd: Cmd, timeout: Duration) -> Option<Value> {
    // `convert_numbers` must stay off here: SENTINEL field/value arrays are
    // flattened by `field_map` via `Value::as_str`, which only matches
    // `Status`/`Text` — a numeric-looking field like `port` would decode to
    // `Value::Int` and silently vanish from the map otherwise.
    let config =
        ClientConfig { connect_timeout: timeout, reply_timeout: timeout, pool_size: 1, eager_connect: true, convert_numbers: false, ..Default::default() };
    let probe = async {
        let conn = Connection::connect(sentinel, &config).await?;
        let reply = conn.execute_command(&cmd).await;
        conn.disconnect().await;
        reply
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(error = %err, ?sentinel.addr, "sentinel probe failed");
            None
        }
        Err(_) => {
            warn!(?sentinel.addr, "sentinel probe timed out");
            None
        }
    }
}

/// Folds a `["field", "value", "field", "value", ...]` flat array into a map.
fn field_map(fields: &[Value]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut pairs = fields.iter();
    while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
        if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn is_down(fields: &HashMap<String, String>) -> bool {
    let Some(flags) = fields.get("flags") else { return false };
    flags.split(',').any(|flag| DOWN_FLAGS.contains(&flag))
}

fn addr_from_fields(fields: &HashMap<String, String>) -> Option<ConnectionAddr> {
    let ip = fields.get("ip")?;
    let port: u16 = fields.get("port")?.parse().ok()?;
    Some(ConnectionAddr::Tcp(ip.clone(), port))
}

/// Picks the address with the highest vote count, ties broken by whichever
/// address appeared first in `candidates` (§4.8 step 1).
fn majority_vote(candidates: Vec<ConnectionAddr>) -> Option<ConnectionAddr> {
    let mut order = Vec::new();
    let mut counts: HashMap<ConnectionAddr, usize> = HashMap::new();
    for addr in candidates {
        if !counts.contains_key(&addr) {
            order.push(addr.clone());
        }
        *counts.entry(addr).or_insert(0) += 1;
    }
    let mut best: Option<(ConnectionAddr, usize)> = None;
    for addr in order {
        let count = counts[&addr];
        match &best {
            Some((_, best_count)) if *best_count >= count => {}
            _ => best = Some((addr, count)),
        }
    }
    best.map(|(addr, _)| addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> ConnectionAddr {
        ConnectionAddr::Tcp(host.to_string(), port)
    }

    #[test]
    fn majority_vote_picks_the_most_reported_address() {
        let candidates = vec![tcp("a", 1), tcp("b", 2), tcp("a", 1), tcp("a", 1), tcp("b", 2)];
        assert_eq!(majority_vote(candidates), Some(tcp("a", 1)));
    }

    #[test]
    fn majority_vote_breaks_ties_by_first_observed() {
        let candidates = vec![tcp("a", 1), tcp("b", 2)];
        assert_eq!(majority_vote(candidates), Some(tcp("a", 1)));
    }

    #[test]
    fn majority_vote_of_nothing_is_none() {
        assert_eq!(majority_vote(Vec::new()), None);
    }

    #[test]
    fn field_map_pairs_up_flat_arrays() {
        let fields = vec![
            Value::Text("name".into()),
            Value::Text("mymaster".into()),
            Value::Text("flags".into()),
            Value::Text("master".into()),
        ];
        let map = field_map(&fields);
        assert_eq!(map.get("name").map(String::as_str), Some("mymaster"));
        assert_eq!(map.get("flags").map(String::as_str), Some("master"));
    }

    #[test]
    fn down_flags_are_detected() {
        let mut fields = HashMap::new();
        fields.insert("flags".to_string(), "slave,s_down".to_string());
        assert!(is_down(&fields));
        fields.insert("flags".to_string(), "master".to_string());
        assert!(!is_down(&fields));
    }

    #[test]
    fn addr_from_fields_requires_ip_and_port() {
        let mut fields = HashMap::new();
        fields.insert("ip".to_string(), "10.0.0.1".to_string());
        fields.insert("port".to_string(), "6379".to_string());
        assert_eq!(addr_from_fields(&fields), Some(tcp("10.0.0.1", 6379)));
        fields.remove("port");
        assert_eq!(addr_from_fields(&fields), None);
    }

    const MASTER_RECORD: &str = concat!(
        "*1\r\n",
        "*10\r\n",
        "$4\r\nname\r\n$8\r\nmymaster\r\n",
        "$2\r\nip\r\n$9\r\n127.0.0.1\r\n",
        "$4\r\nport\r\n$4\r\n6380\r\n",
        "$5\r\nflags\r\n$6\r\nmaster\r\n",
        "$19\r\nnum-other-sentinels\r\n$1\r\n2\r\n",
    );

    #[tokio::test]
    async fn discover_master_queries_a_real_sentinel_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*2\r\n$8\r\nSENTINEL\r\n$7\r\nMASTERS\r\n");
            sock.write_all(MASTER_RECORD.as_bytes()).await.unwrap();
        });

        let sentinel_info = ConnectionInfo { addr: tcp("127.0.0.1", addr.port()), db: 0, username: None, password: None };
        let client = SentinelClient::new(vec![sentinel_info], "mymaster", 1, Duration::from_secs(2));
        let master = client.discover_master().await.unwrap();

        assert_eq!(master, tcp("127.0.0.1", 6380));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn discover_master_rejects_a_master_below_the_sentinel_quorum() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(MASTER_RECORD.as_bytes()).await.unwrap();
        });

        let sentinel_info = ConnectionInfo { addr: tcp("127.0.0.1", addr.port()), db: 0, username: None, password: None };
        // the scripted record reports num-other-sentinels=2; requiring 5 fails quorum.
        let client = SentinelClient::new(vec![sentinel_info], "mymaster", 5, Duration::from_secs(2));
        let err = client.discover_master().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MasterNotFound);
        server.await.unwrap();
    }
}
