//! Connection state machine (C4, §4.4): owns one transport, its [`Router`],
//! and the bookkeeping (current mode, script hash cache) that governs what
//! may legally be sent next.

pub mod pipeline;
pub mod state;
pub mod subscriber;
pub mod transaction;
mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::{ClientConfig, ConnectionAddr, ConnectionInfo};
use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::resp::{Cmd, RespCodec, Value};
use crate::router::Router;
use state::ConnectionState;
use transport::Stream;

pub use pipeline::PipelineHandle;
pub use subscriber::SubscriberConnection;
pub use transaction::TransactionHandle;

/// A handle to one Redis connection. Cheap to clone: every clone shares the
/// same router, and therefore the same underlying socket (§5).
#[derive(Debug, Clone)]
pub struct Connection {
    router: Router,
    state: Arc<Mutex<ConnectionState>>,
    scripts: Arc<Mutex<HashSet<String>>>,
    addr: ConnectionAddr,
    /// Per-command reply deadline, from `ClientConfig::reply_timeout`
    /// (§4.3, §6); blocking commands opt out regardless of this value.
    reply_timeout: Duration,
    /// Set while a caller holds this connection for `watch`-without-`multi`
    /// (§4.6): the state machine stays `Normal` (reads remain legal) but the
    /// pool must not hand this connection to anyone else.
    watch_reserved: Arc<AtomicBool>,
    /// Set by `disconnect` just before the router is dropped, so the pool's
    /// transport-loss watcher (§4.5) can tell an owner-requested teardown
    /// apart from an actual dead socket and skip reconnecting.
    intentional_close: Arc<AtomicBool>,
}

impl Connection {
    /// Opens the transport, performs the handshake (`AUTH` then `SELECT`,
    /// §4.4), and returns a `Connection` in `Normal` state. Any handshake
    /// failure closes the transport and the factory must not retry it as if
    /// it were a transient network error.
    #[instrument(skip(config, info), fields(addr = ?info.addr))]
    pub async fn connect(info: &ConnectionInfo, config: &ClientConfig) -> RedisResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, open(&info.addr))
            .await
            .map_err(|_| RedisError::new(ErrorKind::Timeout, "connect timeout elapsed"))??;

        let codec = RespCodec::new(config.charset, config.convert_numbers);
        let transport = Framed::new(stream, codec);
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);

        let conn = Connection {
            router,
            state: Arc::new(Mutex::new(ConnectionState::Normal)),
            scripts: Arc::new(Mutex::new(HashSet::new())),
            addr: info.addr.clone(),
            reply_timeout: config.reply_timeout,
            watch_reserved: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
        };
        conn.handshake(info).await?;
        Ok(conn)
    }

    #[instrument(skip(self, info))]
    async fn handshake(&self, info: &ConnectionInfo) -> RedisResult<()> {
        if let Some(password) = &info.password {
            let cmd = match &info.username {
                Some(user) => Cmd::new("AUTH").arg(user).arg(password),
                None => Cmd::new("AUTH").arg(password),
            };
            self.raw_execute(&cmd).await?;
        }
        if info.db != 0 {
            self.raw_execute(&Cmd::new("SELECT").arg_int(info.db)).await?;
        }
        debug!("handshake complete");
        Ok(())
    }

    pub fn addr(&self) -> &ConnectionAddr {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Whether a pool dispatcher must skip this connection: either its state
    /// machine is in a non-`Normal` mode, or it is held under a bare `watch`.
    pub fn is_reserved(&self) -> bool {
        self.state().is_reserved() || self.watch_reserved.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// The primitive every typed command wrapper and the Handler façade
    /// build on (§4.6). Checks the legal-command matrix, then routes the
    /// command and surfaces a server `-` reply as an `Err`.
    pub async fn execute_command(&self, cmd: &Cmd) -> RedisResult<Value> {
        self.state().check(cmd.name())?;
        self.raw_execute(cmd).await
    }

    /// Bypasses the state check, for handshake and internal bookkeeping
    /// commands that must run regardless of mode.
    async fn raw_execute(&self, cmd: &Cmd) -> RedisResult<Value> {
        match self.router.send(cmd, self.reply_timeout).await? {
            Value::Error(err) => Err(err),
            value => Ok(value),
        }
    }

    /// `EVAL`/`EVALSHA` with the script-hash cache (§4.4): sends `EVALSHA`
    /// when the script is known to be loaded, falling back to `EVAL` (and
    /// remembering the hash) on `NOSCRIPT`.
    pub async fn eval(&self, script: &str, keys: &[&str], args: &[&str]) -> RedisResult<Value> {
        let digest = sha1_hex(script);
        if self.scripts.lock().unwrap().contains(&digest) {
            let cmd = build_script_cmd("EVALSHA", &digest, keys, args);
            match self.raw_execute(&cmd).await {
                Err(e) if e.kind() == ErrorKind::ScriptDoesNotExist => {
                    self.scripts.lock().unwrap().remove(&digest);
                }
                other => return other,
            }
        }
        let cmd = build_script_cmd("EVAL", script, keys, args);
        let result = self.raw_execute(&cmd).await?;
        self.scripts.lock().unwrap().insert(digest);
        Ok(result)
    }

    pub fn script_flush(&self) {
        self.scripts.lock().unwrap().clear();
    }

    /// Transitions into `Transaction` state, optionally issuing `WATCH`
    /// first, then `MULTI` (§4.6).
    pub async fn multi(&self, watch_keys: &[&str]) -> RedisResult<TransactionHandle> {
        if !watch_keys.is_empty() {
            let mut cmd = Cmd::new("WATCH");
            for key in watch_keys {
                cmd = cmd.arg(key);
            }
            self.raw_execute(&cmd).await?;
        }
        self.raw_execute(&Cmd::new("MULTI")).await?;
        self.set_state(ConnectionState::Transaction);
        Ok(TransactionHandle::new(self.clone()))
    }

    /// `watch(keys)` without `multi` (§4.6): reserves this connection
    /// exclusively while leaving it in `Normal` state, so reads remain
    /// legal until `unwatch` or `multi` supersedes it.
    pub async fn watch(&self, keys: &[&str]) -> RedisResult<()> {
        let mut cmd = Cmd::new("WATCH");
        for key in keys {
            cmd = cmd.arg(key);
        }
        self.raw_execute(&cmd).await?;
        self.watch_reserved.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn unwatch(&self) -> RedisResult<()> {
        let result = self.raw_execute(&Cmd::new("UNWATCH")).await;
        self.watch_reserved.store(false, Ordering::Release);
        result.map(|_| ())
    }

    /// Transitions into `Pipeline` state (§4.6); commands are buffered
    /// locally until `execute` sends them as a single transport write.
    pub fn pipeline(&self) -> PipelineHandle {
        self.set_state(ConnectionState::Pipeline);
        PipelineHandle::new(self.clone())
    }

    pub(crate) fn release_to_normal(&self) {
        self.set_state(ConnectionState::Normal);
        self.watch_reserved.store(false, Ordering::Release);
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Whether this connection was torn down on purpose (`disconnect`)
    /// rather than lost to a transport failure — the pool's reconnect
    /// watcher (§4.5) uses this to avoid reconnecting connections that were
    /// deliberately closed.
    pub(crate) fn is_intentionally_closed(&self) -> bool {
        self.intentional_close.load(Ordering::Acquire)
    }

    /// Closes the connection for good. The router task notices the sender
    /// side is gone and tears down the transport; any still-pending replies
    /// fail with `connection-error`.
    pub async fn disconnect(self) {
        self.set_state(ConnectionState::Closed);
        self.intentional_close.store(true, Ordering::Release);
        drop(self.router);
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.addr {
            ConnectionAddr::Tcp(host, port) => write!(f, "<Redis Connection: {host}:{port}>"),
            ConnectionAddr::Unix(path) => write!(f, "<Redis Connection: {path}>"),
        }
    }
}

async fn open(addr: &ConnectionAddr) -> RedisResult<Stream> {
    match addr {
        ConnectionAddr::Tcp(host, port) => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Stream::Tcp(stream))
        }
        ConnectionAddr::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Stream::Unix(stream))
        }
    }
}

fn sha1_hex(script: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}

fn build_script_cmd(verb: &str, script_or_hash: &str, keys: &[&str], args: &[&str]) -> Cmd {
    let mut cmd = Cmd::new(verb).arg(script_or_hash).arg_int(keys.len() as i64);
    for key in keys {
        cmd = cmd.arg(key);
    }
    for arg in args {
        cmd = cmd.arg(arg);
    }
    cmd
}

/// Minimal hex encoding, kept local rather than pulling in a dedicated crate
/// for four lines of formatting.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::mock_pair;

    async fn connected_pair() -> (Connection, crate::testsupport::MockServer) {
        let (transport, server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);
        let conn = Connection {
            router,
            state: Arc::new(Mutex::new(ConnectionState::Normal)),
            scripts: Arc::new(Mutex::new(HashSet::new())),
            addr: ConnectionAddr::Tcp("mock".into(), 0),
            reply_timeout: crate::router::DEFAULT_REPLY_TIMEOUT,
            watch_reserved: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            intentional_close: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        (conn, server)
    }

    #[tokio::test]
    async fn execute_command_surfaces_server_errors_without_closing() {
        let (conn, mut server) = connected_pair().await;
        tokio::spawn(async move {
            server.expect_and_reply("*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", "-ERR no such key\r\n").await;
        });
        let err = conn.execute_command(&Cmd::new("GET").arg("k")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseError);
        assert_eq!(conn.state(), ConnectionState::Normal);
    }

    #[tokio::test]
    async fn multi_transitions_to_transaction_state() {
        let (conn, mut server) = connected_pair().await;
        tokio::spawn(async move {
            server.expect_and_reply("*1\r\n$5\r\nMULTI\r\n", "+OK\r\n").await;
        });
        let txn = conn.multi(&[]).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Transaction);
        drop(txn);
    }

    #[tokio::test]
    async fn eval_uses_evalsha_once_script_is_cached() {
        let (conn, mut server) = connected_pair().await;
        let digest = sha1_hex("return 1");
        server.reply_raw(":1\r\n").await;
        // first eval (uncached) issues EVAL and primes the cache
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.eval("return 1", &[], &[]).await }
        });
        let _ = server.recv_raw().await;
        assert_eq!(first.await.unwrap().unwrap(), Value::Int(1));
        assert!(conn.scripts.lock().unwrap().contains(&digest));
    }
}
