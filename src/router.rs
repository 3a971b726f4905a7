//! Reply router (C3, §4.3): a FIFO queue of pending requests matched against
//! replies in the order they arrive off the wire.
//!
//! Grounded on the `Pipeline`/`InFlight` pattern used to multiplex a single
//! connection across concurrent callers: one task owns the framed transport
//! and a `VecDeque` of outstanding one-shot reply channels; callers never
//! touch the socket directly, they send a request and await a `oneshot`.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::resp::{Cmd, RespCodec, Value};

/// One outstanding request: the caller's reply channel, how many reply
/// frames it expects (`>1` only for an explicit pipeline batch, §4.6), and
/// when (if ever) it gives up waiting.
struct Pending {
    reply_to: oneshot::Sender<RedisResult<Vec<Value>>>,
    expected: usize,
    buffered: Vec<Value>,
    /// `None` for blocking commands (`BLPOP`/`BRPOP`/`BRPOPLPUSH`, §4.3),
    /// which may legitimately outlive the ordinary reply timeout.
    deadline: Option<Instant>,
}

enum RouterMessage {
    Send {
        packed: Vec<u8>,
        expected: usize,
        reply_to: oneshot::Sender<RedisResult<Vec<Value>>>,
        deadline: Option<Instant>,
    },
}

/// Handle callers use to submit requests to a connection's router task. Cheap
/// to clone; every clone shares the same underlying transport (§5).
#[derive(Debug, Clone)]
pub struct Router {
    sender: mpsc::Sender<RouterMessage>,
    closed: watch::Receiver<bool>,
}

/// Default time a caller will wait for a reply before giving up with
/// `ErrorKind::Timeout` (§4.3, §7); used as the fallback in tests that don't
/// go through `ClientConfig`. Production connections derive this from
/// `ClientConfig::reply_timeout` instead (`Connection::connect`).
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

impl Router {
    /// Spawns the task that owns `transport` and drives requests/replies
    /// across it. Returns a `Router` handle and a future that resolves when
    /// the transport is closed or errors out; the caller is expected to
    /// `tokio::spawn` that future (the connection layer does this, §4.4).
    /// The reply timeout is not fixed here — each [`Router::send`]/
    /// [`Router::send_pipeline`] call supplies its own, so a connection
    /// whose `ClientConfig` changes timeouts mid-life (there is none today,
    /// but nothing here assumes otherwise) would not need re-spawning.
    pub fn spawn<T>(transport: Framed<T, RespCodec>) -> (Self, impl std::future::Future<Output = ()>)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        const QUEUE_DEPTH: usize = 256;
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let driver = async move {
            drive(transport, receiver).await;
            let _ = closed_tx.send(true);
        };
        (Router { sender, closed: closed_rx }, driver)
    }

    /// Sends one packed command and awaits exactly one reply. Blocking
    /// commands (`BLPOP`/`BRPOP`/`BRPOPLPUSH`) opt out of the reply timeout
    /// entirely (§4.3).
    pub async fn send(&self, cmd: &Cmd, reply_timeout: Duration) -> RedisResult<Value> {
        let deadline = (!cmd.is_blocking()).then(|| Instant::now() + reply_timeout);
        let mut replies = self.send_expecting(cmd.packed_command(), 1, deadline).await?;
        Ok(replies.pop().unwrap())
    }

    /// Sends an already-packed batch (e.g. a pipeline, §4.6) expecting
    /// `expected` replies back in the order the commands were written.
    /// `contains_blocking` exempts the whole batch from the reply timeout,
    /// same rule as a single blocking command.
    pub async fn send_pipeline(&self, packed: Vec<u8>, expected: usize, reply_timeout: Duration, contains_blocking: bool) -> RedisResult<Vec<Value>> {
        let deadline = (!contains_blocking).then(|| Instant::now() + reply_timeout);
        self.send_expecting(packed, expected, deadline).await
    }

    /// Whether every `Router` handle sharing this connection's transport has
    /// the same underlying channel — used by the pool (§4.5) to find which
    /// slot a transport-loss notification belongs to.
    pub fn same_channel(&self, other: &Router) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Resolves once the driver task has exited — either the transport was
    /// lost or every `Router` handle was dropped. The pool's reconnect
    /// watcher (§4.5) awaits this to notice a dead connection.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    async fn send_expecting(&self, packed: Vec<u8>, expected: usize, deadline: Option<Instant>) -> RedisResult<Vec<Value>> {
        let (reply_to, receiver) = oneshot::channel();
        self.sender
            .send(RouterMessage::Send { packed, expected, reply_to, deadline })
            .await
            .map_err(|_| RedisError::new(ErrorKind::ConnectionError, "connection task has shut down"))?;
        receiver
            .await
            .map_err(|_| RedisError::new(ErrorKind::ConnectionError, "connection closed before a reply arrived"))?
    }
}

/// The router task body: pulls outbound requests, writes them, and matches
/// inbound replies against the pending queue in strict FIFO order (§4.3).
async fn drive<T>(mut transport: Framed<T, RespCodec>, mut inbox: mpsc::Receiver<RouterMessage>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let mut pending: VecDeque<Pending> = VecDeque::new();
    loop {
        let deadline_elapsed = async {
            match pending.front().and_then(|p| p.deadline) {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = deadline_elapsed => {
                // The head-of-line request's deadline passed: fail it with
                // Timeout, then fail everything queued behind it with
                // connection-error and close the transport, rather than
                // leaving a stuck request blocking the rest of the FIFO
                // (§4.3, §8 "first fails timeout, second fails
                // connection-error").
                warn!("reply timeout elapsed, closing connection");
                let head = pending.pop_front().expect("deadline only set while pending is non-empty");
                let _ = head.reply_to.send(Err(RedisError::new(ErrorKind::Timeout, "reply timeout elapsed")));
                fail_all(&mut pending, RedisError::new(ErrorKind::ConnectionError, "connection closed after a reply timeout"));
                return;
            }
            reply = transport.next(), if !pending.is_empty() => {
                match reply {
                    Some(Ok(value)) => dispatch_reply(&mut pending, Ok(value)),
                    Some(Err(err)) => {
                        warn!(error = %err, "connection closed by a fatal decode error");
                        fail_all(&mut pending, err);
                        return;
                    }
                    None => {
                        debug!("transport stream ended");
                        fail_all(&mut pending, RedisError::new(ErrorKind::ConnectionError, "connection closed"));
                        return;
                    }
                }
            }
            msg = inbox.recv() => {
                match msg {
                    None => return, // every Router handle was dropped
                    Some(RouterMessage::Send { packed, expected, reply_to, deadline }) => {
                        if let Err(err) = write_raw(&mut transport, &packed).await {
                            let _ = reply_to.send(Err(err.clone()));
                            fail_all(&mut pending, err);
                            return;
                        }
                        pending.push_back(Pending { reply_to, expected, buffered: Vec::with_capacity(expected), deadline });
                    }
                }
            }
        }
    }
}

async fn write_raw<T>(transport: &mut Framed<T, RespCodec>, packed: &[u8]) -> RedisResult<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    transport.send(packed).await?;
    Ok(())
}

fn dispatch_reply(pending: &mut VecDeque<Pending>, reply: RedisResult<Value>) {
    let Some(front) = pending.front_mut() else {
        // a reply arrived with nothing waiting for it; out-of-band pushes
        // (C9) are routed before reaching the plain router, so this is an
        // unexpected extra reply and is simply dropped.
        return;
    };
    match reply {
        Ok(value) => {
            front.buffered.push(value);
            if front.buffered.len() == front.expected {
                let done = pending.pop_front().unwrap();
                let _ = done.reply_to.send(Ok(done.buffered));
            }
        }
        Err(err) => {
            let done = pending.pop_front().unwrap();
            let _ = done.reply_to.send(Err(err));
        }
    }
}

/// Fails every still-pending request with the same error, used when the
/// transport is lost (§4.3 "connection-loss propagation").
fn fail_all(pending: &mut VecDeque<Pending>, err: RedisError) {
    while let Some(p) = pending.pop_front() {
        let _ = p.reply_to.send(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::mock_pair;

    #[tokio::test]
    async fn routes_single_reply_to_the_caller() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);
        server.expect_and_reply("*1\r\n$4\r\nPING\r\n", "+PONG\r\n").await;
        let reply = router.send(&Cmd::new("PING"), DEFAULT_REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply, Value::Status("PONG".into()));
    }

    #[tokio::test]
    async fn preserves_fifo_order_under_concurrent_callers() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);

        let a = router.clone();
        let b = router.clone();
        let task_a = tokio::spawn(async move { a.send(&Cmd::new("GET").arg("a"), DEFAULT_REPLY_TIMEOUT).await });
        let task_b = tokio::spawn(async move { b.send(&Cmd::new("GET").arg("b"), DEFAULT_REPLY_TIMEOUT).await });

        server.expect_and_reply("*2\r\n$3\r\nGET\r\n$1\r\na\r\n", "$1\r\n1\r\n").await;
        server.expect_and_reply("*2\r\n$3\r\nGET\r\n$1\r\nb\r\n", "$1\r\n2\r\n").await;

        assert_eq!(task_a.await.unwrap().unwrap(), Value::Int(1));
        assert_eq!(task_b.await.unwrap().unwrap(), Value::Int(2));
    }

    #[tokio::test]
    async fn lost_connection_fails_pending_callers() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);

        let pending = tokio::spawn({
            let router = router.clone();
            async move { router.send(&Cmd::new("GET").arg("x"), DEFAULT_REPLY_TIMEOUT).await }
        });
        server.recv_raw().await;
        server.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn reply_timeout_fails_the_head_and_closes_the_connection_for_the_rest_of_the_queue() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);

        let first = tokio::spawn({
            let router = router.clone();
            async move { router.send(&Cmd::new("GET").arg("a"), Duration::from_millis(20)).await }
        });
        // let the first request land on the wire and get queued before the
        // second one is sent, so the FIFO order is deterministic.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tokio::spawn({
            let router = router.clone();
            async move { router.send(&Cmd::new("GET").arg("b"), Duration::from_millis(20)).await }
        });

        // never reply; let the deadline elapse.
        let _ = server.recv_raw().await;

        let first_err = first.await.unwrap().unwrap_err();
        let second_err = second.await.unwrap().unwrap_err();
        assert_eq!(first_err.kind(), ErrorKind::Timeout);
        assert_eq!(second_err.kind(), ErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn blocking_commands_are_not_subject_to_the_reply_timeout() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);

        let call = tokio::spawn({
            let router = router.clone();
            async move { router.send(&Cmd::new("BLPOP").arg("list").arg_int(0), Duration::from_millis(10)).await }
        });
        // well past the configured reply timeout; a non-blocking command
        // would already have failed by now.
        tokio::time::sleep(Duration::from_millis(40)).await;
        server
            .expect_and_reply(
                "*3\r\n$5\r\nBLPOP\r\n$4\r\nlist\r\n$1\r\n0\r\n",
                "*2\r\n$4\r\nlist\r\n$1\r\nv\r\n",
            )
            .await;

        let value = call.await.unwrap().unwrap();
        assert!(matches!(value, Value::Array(_)));
    }
}
