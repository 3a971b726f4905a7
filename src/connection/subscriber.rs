//! Subscriber mode (C9, §4.9): a dedicated connection variant that does not
//! go through the [`crate::router::Router`]'s one-reply-per-request FIFO,
//! because subscribe acknowledgements and pushed messages both arrive
//! unsolicited and interleaved on the same stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::warn;

use crate::config::{ClientConfig, ConnectionAddr, ConnectionInfo};
use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::pool::jittered;
use crate::resp::{Cmd, RespCodec, Value};

use super::transport::Stream;

/// Invoked for every pushed `message`/`pmessage`; `pattern` is `None` for a
/// plain channel message (§4.9).
pub type MessageCallback = Box<dyn FnMut(Option<String>, String, Value) + Send + 'static>;

pub struct SubscriberConnection {
    outbox: mpsc::UnboundedSender<Cmd>,
    channels: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
}

impl SubscriberConnection {
    /// Opens a connection dedicated to pub/sub and spawns the supervisor
    /// task that drives it for the rest of its life, dispatching pushes to
    /// `on_message` and transparently reconnecting-and-resubscribing on
    /// transport loss (§4.9).
    pub async fn connect(info: &ConnectionInfo, config: &ClientConfig, on_message: MessageCallback) -> RedisResult<Self> {
        let transport = handshake(info, config).await?;
        let (outbox, inbox) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(HashSet::new()));
        let patterns = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(supervise(transport, inbox, on_message, info.clone(), config.clone(), channels.clone(), patterns.clone()));
        Ok(SubscriberConnection { outbox, channels, patterns })
    }

    pub fn subscribe(&self, channels: &[&str]) -> RedisResult<()> {
        let mut cmd = Cmd::new("SUBSCRIBE");
        for ch in channels {
            cmd = cmd.arg(ch);
            self.channels.lock().unwrap().insert(ch.to_string());
        }
        self.send(cmd)
    }

    pub fn psubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        let mut cmd = Cmd::new("PSUBSCRIBE");
        for p in patterns {
            cmd = cmd.arg(p);
            self.patterns.lock().unwrap().insert(p.to_string());
        }
        self.send(cmd)
    }

    pub fn unsubscribe(&self, channels: &[&str]) -> RedisResult<()> {
        let mut cmd = Cmd::new("UNSUBSCRIBE");
        for ch in channels {
            cmd = cmd.arg(ch);
            self.channels.lock().unwrap().remove(*ch);
        }
        self.send(cmd)
    }

    pub fn punsubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        let mut cmd = Cmd::new("PUNSUBSCRIBE");
        for p in patterns {
            cmd = cmd.arg(p);
            self.patterns.lock().unwrap().remove(*p);
        }
        self.send(cmd)
    }

    /// Channels/patterns this handle considers itself subscribed to; the
    /// authoritative set a reconnect would replay (§4.9).
    pub fn subscriptions(&self) -> (Vec<String>, Vec<String>) {
        (
            self.channels.lock().unwrap().iter().cloned().collect(),
            self.patterns.lock().unwrap().iter().cloned().collect(),
        )
    }

    fn send(&self, cmd: Cmd) -> RedisResult<()> {
        self.outbox
            .send(cmd)
            .map_err(|_| RedisError::new(ErrorKind::ConnectionError, "subscriber connection task has shut down"))
    }
}

async fn send_and_await_reply<T>(transport: &mut Framed<T, RespCodec>, cmd: &Cmd) -> RedisResult<Value>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    transport.send(cmd.packed_command().as_slice()).await?;
    match transport.next().await {
        Some(Ok(Value::Error(err))) => Err(err),
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err),
        None => Err(RedisError::new(ErrorKind::ConnectionError, "connection closed during handshake")),
    }
}

/// Opens the transport and performs `AUTH`/`SELECT`, shared by the initial
/// connect and every reconnect attempt.
async fn handshake(info: &ConnectionInfo, config: &ClientConfig) -> RedisResult<Framed<Stream, RespCodec>> {
    let stream = tokio::time::timeout(config.connect_timeout, open(&info.addr))
        .await
        .map_err(|_| RedisError::new(ErrorKind::Timeout, "connect timeout elapsed"))??;
    let codec = RespCodec::new(config.charset, config.convert_numbers);
    let mut transport = Framed::new(stream, codec);

    if let Some(password) = &info.password {
        let cmd = match &info.username {
            Some(user) => Cmd::new("AUTH").arg(user).arg(password),
            None => Cmd::new("AUTH").arg(password),
        };
        send_and_await_reply(&mut transport, &cmd).await?;
    }
    if info.db != 0 {
        send_and_await_reply(&mut transport, &Cmd::new("SELECT").arg_int(info.db)).await?;
    }
    Ok(transport)
}

enum StopReason {
    /// Every `SubscriberConnection` clone was dropped; shut down for good.
    OutboxClosed,
    /// The transport errored or the peer closed the socket.
    TransportLost(RedisError),
}

/// Owns the transport across its whole lifetime, reconnecting and replaying
/// `channels`/`patterns` against the fresh connection whenever it is lost
/// (§4.9's "re-subscribed before `message_received` resumes").
async fn supervise(
    mut transport: Framed<Stream, RespCodec>,
    mut inbox: mpsc::UnboundedReceiver<Cmd>,
    mut on_message: MessageCallback,
    info: ConnectionInfo,
    config: ClientConfig,
    channels: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
) {
    loop {
        match run(&mut transport, &mut inbox, &mut on_message).await {
            StopReason::OutboxClosed => return,
            StopReason::TransportLost(err) => {
                warn!(error = %err, "subscriber connection lost, attempting to reconnect");
            }
        }

        let mut backoff = config.reconnect_initial_backoff;
        loop {
            tokio::time::sleep(jittered(backoff)).await;
            match handshake(&info, &config).await {
                Ok(mut fresh) => match resubscribe(&mut fresh, &channels, &patterns).await {
                    Ok(()) => {
                        transport = fresh;
                        break;
                    }
                    Err(err) => warn!(error = %err, "resubscribe after reconnect failed"),
                },
                Err(err) => {
                    warn!(error = %err, delay = ?backoff, "subscriber reconnect attempt failed");
                }
            }
            backoff = std::cmp::min(backoff * 2, config.reconnect_max_backoff);
        }
    }
}

/// One connection's worth of dispatch: forwards outbound `SUBSCRIBE`-family
/// commands and dispatches inbound pushes, until the transport is lost or
/// every `SubscriberConnection` handle is dropped. Generic over the
/// transport so it can be driven directly against a bare `TcpStream` in
/// tests, without going through the `Stream` enum `supervise` reconnects.
async fn run<T>(
    transport: &mut Framed<T, RespCodec>,
    inbox: &mut mpsc::UnboundedReceiver<Cmd>,
    on_message: &mut MessageCallback,
) -> StopReason
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = transport.next() => {
                match frame {
                    Some(Ok(value)) => dispatch_push(value, on_message),
                    Some(Err(err)) => return StopReason::TransportLost(err),
                    None => return StopReason::TransportLost(RedisError::new(ErrorKind::ConnectionError, "connection closed")),
                }
            }
            cmd = inbox.recv() => {
                match cmd {
                    None => return StopReason::OutboxClosed,
                    Some(cmd) => {
                        if let Err(err) = transport.send(cmd.packed_command().as_slice()).await {
                            return StopReason::TransportLost(err);
                        }
                    }
                }
            }
        }
    }
}

/// Replays every tracked channel/pattern against a freshly (re)connected
/// transport. Acknowledgement pushes are picked up and silently dropped by
/// `dispatch_push` once `run` resumes, same as on first subscribe.
async fn resubscribe<T>(
    transport: &mut Framed<T, RespCodec>,
    channels: &Arc<Mutex<HashSet<String>>>,
    patterns: &Arc<Mutex<HashSet<String>>>,
) -> RedisResult<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let channels: Vec<String> = channels.lock().unwrap().iter().cloned().collect();
    if !channels.is_empty() {
        let mut cmd = Cmd::new("SUBSCRIBE");
        for ch in &channels {
            cmd = cmd.arg(ch);
        }
        transport.send(cmd.packed_command().as_slice()).await?;
    }
    let patterns: Vec<String> = patterns.lock().unwrap().iter().cloned().collect();
    if !patterns.is_empty() {
        let mut cmd = Cmd::new("PSUBSCRIBE");
        for p in &patterns {
            cmd = cmd.arg(p);
        }
        transport.send(cmd.packed_command().as_slice()).await?;
    }
    Ok(())
}

fn dispatch_push(value: Value, on_message: &mut MessageCallback) {
    let Value::Array(items) = value else {
        return;
    };
    match items.as_slice() {
        [Value::Text(kind), Value::Text(channel), payload] if kind == "message" => {
            on_message(None, channel.clone(), payload.clone());
        }
        [Value::Text(kind), Value::Text(pattern), Value::Text(channel), payload] if kind == "pmessage" => {
            on_message(Some(pattern.clone()), channel.clone(), payload.clone());
        }
        // subscribe/unsubscribe acknowledgements carry a channel and count;
        // there is no caller-visible callback for these (§4.9 only documents
        // message delivery).
        _ => {}
    }
}

async fn open(addr: &ConnectionAddr) -> RedisResult<Stream> {
    match addr {
        ConnectionAddr::Tcp(host, port) => Ok(Stream::Tcp(TcpStream::connect((host.as_str(), *port)).await?)),
        ConnectionAddr::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::mock_pair;

    #[tokio::test]
    async fn dispatches_plain_messages_without_pattern() {
        let (mut transport, mut server) = mock_pair().await;
        let (_outbox, mut inbox) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let mut on_message: MessageCallback = Box::new(move |pattern, channel, payload| {
            received_clone.lock().unwrap().push((pattern, channel, payload));
        });
        tokio::spawn(async move {
            run(&mut transport, &mut inbox, &mut on_message).await;
        });

        server
            .reply_raw("*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (None, "news".to_string(), Value::Text("hello".to_string())));
    }

    #[tokio::test]
    async fn resubscribe_replays_tracked_channels_and_patterns() {
        let (mut transport, mut server) = mock_pair().await;
        let channels = Arc::new(Mutex::new(HashSet::from(["news".to_string()])));
        let patterns = Arc::new(Mutex::new(HashSet::from(["chat.*".to_string()])));

        let server_task = tokio::spawn(async move {
            server.expect_and_reply("*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n", "").await;
            server.expect_and_reply("*2\r\n$10\r\nPSUBSCRIBE\r\n$6\r\nchat.*\r\n", "").await;
        });

        resubscribe(&mut transport, &channels, &patterns).await.unwrap();
        server_task.await.unwrap();
    }
}
