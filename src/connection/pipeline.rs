//! Explicit pipeline mode (§4.4, §4.6): buffer commands locally, then send
//! them as one transport write and harvest replies in submission order.

use crate::error::RedisResult;
use crate::resp::{Cmd, Pipeline, Value};

use super::Connection;

pub struct PipelineHandle {
    conn: Connection,
    buffer: Pipeline,
}

impl PipelineHandle {
    pub(crate) fn new(conn: Connection) -> Self {
        PipelineHandle { conn, buffer: Pipeline::new() }
    }

    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.buffer.add(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes every buffered command in one go and returns the replies in
    /// the order they were added, then releases the connection back to
    /// `Normal`.
    pub async fn execute(self) -> RedisResult<Vec<Value>> {
        let expected = self.buffer.len();
        let contains_blocking = self.buffer.is_blocking();
        let result = self
            .conn
            .router()
            .send_pipeline(self.buffer.packed(), expected, self.conn.reply_timeout, contains_blocking)
            .await;
        self.conn.release_to_normal();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionAddr;
    use crate::connection::state::ConnectionState;
    use crate::router::Router;
    use crate::testsupport::mock_pair;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn execute_sends_one_write_and_returns_ordered_replies() {
        let (transport, mut server) = mock_pair().await;
        let (router, driver) = Router::spawn(transport);
        tokio::spawn(driver);
        let conn = Connection {
            router,
            state: Arc::new(Mutex::new(ConnectionState::Pipeline)),
            scripts: Arc::new(Mutex::new(HashSet::new())),
            addr: ConnectionAddr::Tcp("mock".into(), 0),
            reply_timeout: crate::router::DEFAULT_REPLY_TIMEOUT,
            watch_reserved: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            intentional_close: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        let mut pipeline = PipelineHandle::new(conn.clone());
        pipeline.add(Cmd::new("PING"));
        pipeline.add(Cmd::new("GET").arg("k"));

        let server_task = tokio::spawn(async move {
            let expected = "*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
            server.expect_and_reply(expected, "+PONG\r\n$1\r\nv\r\n").await;
        });

        let replies = pipeline.execute().await.unwrap();
        assert_eq!(replies, vec![Value::Status("PONG".into()), Value::Text("v".into())]);
        assert_eq!(conn.state(), ConnectionState::Normal);
        server_task.await.unwrap();
    }
}
