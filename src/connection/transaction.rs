//! `MULTI`/`EXEC`/`DISCARD` handle (§4.4, §4.6).

use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::resp::{Cmd, Value};

use super::Connection;

/// Bound to one exclusively-reserved [`Connection`] already in `Transaction`
/// state. Every `queue` call enqueues a command on the server, which
/// acknowledges with `QUEUED`; `commit`/`discard` terminate the transaction
/// and release the connection back to the pool.
pub struct TransactionHandle {
    conn: Connection,
    queued: usize,
}

impl TransactionHandle {
    pub(crate) fn new(conn: Connection) -> Self {
        TransactionHandle { conn, queued: 0 }
    }

    /// Enqueues one command. The server replies `QUEUED`; callers that care
    /// about a specific command's result read it out of the array `commit`
    /// returns.
    pub async fn queue(&mut self, cmd: &Cmd) -> RedisResult<()> {
        match self.conn.raw_execute(cmd).await? {
            Value::Status(s) if s == "QUEUED" => {
                self.queued += 1;
                Ok(())
            }
            other => Err(RedisError::new(
                ErrorKind::ResponseError,
                format!("expected QUEUED, server replied {other:?}"),
            )),
        }
    }

    /// Issues `EXEC`. A null array means a watched key changed and the whole
    /// transaction was aborted server-side (§7 *watch-error*).
    pub async fn commit(self) -> RedisResult<Vec<Value>> {
        let result = self.conn.raw_execute(&Cmd::new("EXEC")).await;
        self.conn.release_to_normal();
        match result? {
            Value::Nil => Err(RedisError::new(ErrorKind::WatchError, "a watched key was modified before EXEC")),
            Value::Array(items) => Ok(items),
            other => Err(RedisError::new(ErrorKind::InvalidResponse, format!("EXEC returned {other:?}"))),
        }
    }

    pub async fn discard(self) -> RedisResult<()> {
        let result = self.conn.raw_execute(&Cmd::new("DISCARD")).await;
        self.conn.release_to_normal();
        result.map(|_| ())
    }

    pub fn queued_len(&self) -> usize {
        self.queued
    }
}
