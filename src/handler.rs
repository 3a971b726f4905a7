//! Handler façade (C6, §4.6): the public entry point bundling a [`Factory`]
//! pool behind `execute_command`, the typed command wrappers, `multi`,
//! `watch`, `pipeline`, and `disconnect`.

use std::time::Duration;

use crate::config::{ClientConfig, ConnectionAddr, ConnectionInfo};
use crate::connection::{Connection, PipelineHandle, TransactionHandle};
use crate::error::RedisResult;
use crate::pool::Factory;
use crate::resp::{Cmd, Value};
use crate::sentinel::SentinelClient;

/// A connection held exclusively under `watch` without `multi` (§4.6): reads
/// remain legal, but the pool will not hand this connection to anyone else
/// until `unwatch` releases it.
pub struct WatchHandle {
    conn: Connection,
}

impl WatchHandle {
    pub async fn execute(&self, cmd: &Cmd) -> RedisResult<Value> {
        self.conn.execute_command(cmd).await
    }

    pub async fn unwatch(self) -> RedisResult<()> {
        self.conn.unwatch().await
    }
}

/// The client-facing handle to one Redis endpoint (or, via
/// [`crate::sharder::Sharder`], a set of them).
#[derive(Clone)]
pub struct Handler {
    factory: Factory,
}

impl Handler {
    pub async fn connect(url: &str, config: ClientConfig) -> RedisResult<Self> {
        let info = ConnectionInfo::parse(url)?;
        let factory = Factory::new(info, config).await?;
        Ok(Handler { factory })
    }

    pub(crate) fn from_factory(factory: Factory) -> Self {
        Handler { factory }
    }

    /// Resolves the current master for `service_name` through `sentinel`,
    /// builds a pool against it, and keeps the pool pointed at the live
    /// master by polling Sentinel every `reconfigure_interval` (§4.8 step 4).
    /// `db`/credentials come from `template`; only the address Sentinel
    /// reports varies across reconfigurations.
    pub async fn connect_via_sentinel(
        sentinel: SentinelClient,
        template: ConnectionInfo,
        config: ClientConfig,
        reconfigure_interval: Duration,
    ) -> RedisResult<Self> {
        let master = sentinel.discover_master().await?;
        let mut info = template.clone();
        info.addr = master;
        let factory = Factory::new(info.clone(), config).await?;
        sentinel.watch(factory.clone(), info, reconfigure_interval);
        Ok(Handler { factory })
    }

    pub async fn ready(&self) {
        self.factory.ready().await
    }

    /// The sole dispatch primitive: acquires a non-reserved connection and
    /// sends `cmd` on it.
    pub async fn execute_command(&self, cmd: &Cmd) -> RedisResult<Value> {
        let conn = self.factory.get_connection().await?;
        conn.execute_command(cmd).await
    }

    pub async fn get(&self, key: &str) -> RedisResult<Value> {
        self.execute_command(&Cmd::new("GET").arg(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> RedisResult<Value> {
        self.execute_command(&Cmd::new("SET").arg(key).arg(value)).await
    }

    pub async fn del(&self, keys: &[&str]) -> RedisResult<Value> {
        let mut cmd = Cmd::new("DEL");
        for key in keys {
            cmd = cmd.arg(key);
        }
        self.execute_command(&cmd).await
    }

    pub async fn ping(&self) -> RedisResult<Value> {
        self.execute_command(&Cmd::new("PING")).await
    }

    pub async fn role(&self) -> RedisResult<Value> {
        self.execute_command(&Cmd::new("ROLE")).await
    }

    /// Acquires an exclusive connection, optionally `WATCH`es the given
    /// keys, issues `MULTI`, and returns the bound transaction handle
    /// (§4.6).
    pub async fn multi(&self, watch_keys: &[&str]) -> RedisResult<TransactionHandle> {
        let conn = self.factory.get_connection_exclusive().await?;
        conn.multi(watch_keys).await
    }

    /// `watch(keys)` without `multi` (§4.6).
    pub async fn watch(&self, keys: &[&str]) -> RedisResult<WatchHandle> {
        let conn = self.factory.get_connection_exclusive().await?;
        conn.watch(keys).await?;
        Ok(WatchHandle { conn })
    }

    /// Acquires an exclusive connection and returns a buffer that batches
    /// commands for one transport write on `execute` (§4.6).
    pub async fn pipeline(&self) -> RedisResult<PipelineHandle> {
        let conn = self.factory.get_connection_exclusive().await?;
        Ok(conn.pipeline())
    }

    /// Stops reconnection and tears down every connection; resolves once
    /// the pool is empty.
    pub async fn disconnect(&self) {
        self.factory.disconnect().await
    }

    pub async fn connection_count(&self) -> usize {
        self.factory.size().await
    }
}

impl std::fmt::Display for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.factory.display_count();
        if count == 0 {
            return write!(f, "<Redis Connection: Not connected>");
        }
        match self.factory.target_addr() {
            ConnectionAddr::Tcp(host, port) => write!(f, "<Redis Connection: {host}:{port} - {count} connection(s)>"),
            ConnectionAddr::Unix(path) => write!(f, "<Redis Connection: {path} - {count} connection(s)>"),
        }
    }
}
