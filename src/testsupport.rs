//! In-process mock server harness (A4), used by every layer's tests instead
//! of a real `redis-server`. Replaces the teacher's raw-libc socket helpers
//! (`anet.rs`) with a loopback TCP harness built directly on `tokio::net`,
//! since every transport in this crate already runs on `tokio::net` sockets.

#![cfg(test)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::resp::RespCodec;

/// One end of an in-memory client/server TCP pair, with the client side
/// already wrapped in a [`RespCodec`]-framed transport ready to hand to
/// [`crate::router::Router::spawn`].
pub async fn mock_pair() -> (Framed<TcpStream, RespCodec>, MockServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.expect("connect to mock listener");
    let (server, _) = listener.accept().await.expect("accept mock connection");
    let transport = Framed::new(client, RespCodec::new(Some(&crate::resp::value::encoding::UTF8), true));
    (transport, MockServer { socket: server })
}

/// The server side of a [`mock_pair`], driven directly at the byte level so
/// tests can assert exactly what was written to the wire.
pub struct MockServer {
    socket: TcpStream,
}

impl MockServer {
    /// Reads exactly `expected.len()` bytes and asserts they match, then
    /// writes `reply` back.
    pub async fn expect_and_reply(&mut self, expected: &str, reply: &str) {
        let received = self.recv_exact(expected.len()).await;
        assert_eq!(received, expected, "unexpected bytes written to the mock server");
        self.socket.write_all(reply.as_bytes()).await.expect("write mock reply");
    }

    /// Reads and discards whatever is currently available, for tests that
    /// only care that a write happened before the connection is torn down.
    pub async fn recv_raw(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = self.socket.read(&mut buf).await.expect("read from mock client");
        buf.truncate(n);
        buf
    }

    async fn recv_exact(&mut self, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.socket.read_exact(&mut buf).await.expect("read expected bytes from mock client");
        String::from_utf8(buf).expect("mock traffic is valid utf-8")
    }

    /// Writes a raw, already-encoded reply without checking what was sent.
    pub async fn reply_raw(&mut self, reply: &str) {
        self.socket.write_all(reply.as_bytes()).await.expect("write mock reply");
    }

    /// Drops the server side of the socket, simulating the remote end
    /// closing the connection.
    pub async fn close(mut self) {
        let _ = self.socket.shutdown().await;
    }
}
