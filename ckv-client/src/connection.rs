//! # Node Connection
//!
//! Purpose: One multiplexed connection per node. Any number of callers send
//! requests over it concurrently; replies are matched to requests in the
//! order the requests were written.
//!
//! ## Design Principles
//! 1. **Actor Pattern**: A spawned task owns the socket. Handles talk to it
//!    through an unbounded channel and get their reply on a oneshot.
//! 2. **FIFO Correlation**: RESP replies arrive in request order, so a
//!    queue of pending requests is all the bookkeeping needed.
//! 3. **Abandon, Don't Retract**: A caller that stops waiting drops its
//!    receiver. The reply still arrives and is discarded.
//! 4. **Fail Everything on I/O Error**: A broken socket fails every pending
//!    and queued request and marks the handle broken.
//!
//! ## Data Flow
//!
//! ```text
//! send() --Request--> [mpsc] --> driver --bytes--> socket
//!   ^                              |
//!   +------ oneshot <-- pending <--+<--bytes--- socket
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use ckv_common::{encode_command, parse_value, Command, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::NodeAddress;
use crate::error::{ClientError, ClientResult};

const READ_BUFFER_CAPACITY: usize = 4096;

/// Byte stream a node connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transport streams to nodes.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, addr: &NodeAddress) -> io::Result<BoxedStream>;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &NodeAddress) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        // Small request frames; do not wait to coalesce them.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

struct Request {
    payload: BytesMut,
    expected: usize,
    reply: oneshot::Sender<ClientResult<Vec<Value>>>,
}

struct Pending {
    expected: usize,
    values: Vec<Value>,
    reply: oneshot::Sender<ClientResult<Vec<Value>>>,
}

/// Cloneable handle to a node's connection task.
#[derive(Clone)]
pub struct NodeConnection {
    addr: NodeAddress,
    requests: mpsc::UnboundedSender<Request>,
    broken: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("addr", &self.addr)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl NodeConnection {
    /// Spawns the driver task for `stream` and returns its handle.
    ///
    /// The task stops when `shutdown` fires, when the stream fails, or when
    /// every handle has been dropped.
    pub fn spawn(addr: NodeAddress, stream: BoxedStream, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(
            addr.clone(),
            stream,
            rx,
            broken.clone(),
            shutdown.clone(),
        ));
        NodeConnection {
            addr,
            requests: tx,
            broken,
            shutdown,
        }
    }

    pub fn addr(&self) -> &NodeAddress {
        &self.addr
    }

    /// Sends one command and waits for its reply.
    ///
    /// Error replies come back as `Value::ServerError`; classifying them is
    /// up to the caller.
    pub async fn send(&self, cmd: &Command) -> ClientResult<Value> {
        let mut values = self.send_batch(std::slice::from_ref(cmd)).await?;
        values.pop().ok_or(ClientError::UnexpectedResponse)
    }

    /// Writes all commands back to back and waits for one reply per command.
    pub async fn send_batch(&self, cmds: &[Command]) -> ClientResult<Vec<Value>> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closing);
        }
        if self.is_broken() {
            return Err(self.closed_error());
        }

        let mut payload = BytesMut::with_capacity(cmds.iter().map(|c| 16 * c.frame_len()).sum());
        for cmd in cmds {
            encode_command(cmd, &mut payload);
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request {
                payload,
                expected: cmds.len(),
                reply,
            })
            .map_err(|_| self.closed_error())?;

        rx.await.map_err(|_| self.closed_error())?
    }

    /// True once the driver has stopped.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire) || self.requests.is_closed()
    }

    /// Stops the driver; pending requests fail with `Closing`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn closed_error(&self) -> ClientError {
        if self.shutdown.is_cancelled() {
            return ClientError::Closing;
        }
        ClientError::connection(
            &self.addr,
            io::Error::new(io::ErrorKind::NotConnected, "connection closed"),
        )
    }
}

async fn drive(
    addr: NodeAddress,
    stream: BoxedStream,
    mut requests: mpsc::UnboundedReceiver<Request>,
    broken: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let mut pending: VecDeque<Pending> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break ClientError::Closing,
            request = requests.recv() => {
                let Some(request) = request else {
                    // Every handle is gone; nobody can wait on replies.
                    return;
                };
                // Queue before writing so a fast reply always finds its entry.
                pending.push_back(Pending {
                    expected: request.expected,
                    values: Vec::with_capacity(request.expected),
                    reply: request.reply,
                });
                let written = async {
                    writer.write_all(&request.payload).await?;
                    writer.flush().await
                };
                if let Err(err) = written.await {
                    break ClientError::connection(&addr, err);
                }
            }
            read = reader.read_buf(&mut read_buf) => match read {
                Ok(0) => {
                    break ClientError::connection(
                        &addr,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by node"),
                    );
                }
                Ok(_) => {
                    if let Err(err) = dispatch_replies(&addr, &mut read_buf, &mut pending) {
                        break err;
                    }
                }
                Err(err) => break ClientError::connection(&addr, err),
            },
        }
    };

    broken.store(true, Ordering::Release);
    debug!(node = %addr, error = %failure, pending = pending.len(), "connection stopped");

    requests.close();
    for entry in pending.drain(..) {
        let _ = entry.reply.send(Err(failure.clone()));
    }
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(failure.clone()));
    }
}

fn dispatch_replies(
    addr: &NodeAddress,
    read_buf: &mut BytesMut,
    pending: &mut VecDeque<Pending>,
) -> ClientResult<()> {
    loop {
        let (value, consumed) = match parse_value(read_buf) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(source) => {
                return Err(ClientError::Protocol {
                    addr: addr.to_string(),
                    source,
                })
            }
        };
        read_buf.advance(consumed);

        if let Value::Push { kind, .. } = &value {
            trace!(node = %addr, kind = %kind, "dropping push message");
            continue;
        }

        let Some(front) = pending.front_mut() else {
            debug!(node = %addr, "discarding unsolicited reply");
            continue;
        };
        front.values.push(value);
        if front.values.len() == front.expected {
            if let Some(done) = pending.pop_front() {
                // A dropped receiver means the caller gave up; the reply is discarded.
                let _ = done.reply.send(Ok(done.values));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::duplex;

    fn addr() -> NodeAddress {
        NodeAddress::new("127.0.0.1", 7000)
    }

    async fn read_some(server: &mut tokio::io::DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn replies_match_requests_in_order() {
        let (client, mut server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("GET").arg("a")).await })
        };
        read_some(&mut server, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n").await;
        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("GET").arg("b")).await })
        };
        read_some(&mut server, b"*2\r\n$3\r\nGET\r\n$1\r\nb\r\n").await;

        server.write_all(b"$1\r\n1\r\n$1\r\n2\r\n").await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Value::BulkString(Bytes::from_static(b"1")));
        assert_eq!(second.await.unwrap().unwrap(), Value::BulkString(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn batch_collects_one_reply_per_command() {
        let (client, mut server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());
        let task = tokio::spawn(async move {
            conn.send_batch(&[Command::new("MULTI"), Command::new("EXEC")]).await
        });
        read_some(&mut server, b"*1\r\n$5\r\nMULTI\r\n*1\r\n$4\r\nEXEC\r\n").await;
        // Push frames in between do not count as replies.
        server.write_all(b"+OK\r\n>2\r\n+invalidate\r\n_\r\n*0\r\n").await.unwrap();
        let values = task.await.unwrap().unwrap();
        assert_eq!(values, vec![Value::SimpleString("OK".into()), Value::Array(vec![])]);
    }

    #[tokio::test]
    async fn abandoned_request_does_not_shift_replies() {
        let (client, mut server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), conn.send(&Command::new("PING"))).await;
        assert!(abandoned.is_err());
        read_some(&mut server, b"*1\r\n$4\r\nPING\r\n").await;

        let next = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("ECHO").arg("x")).await })
        };
        read_some(&mut server, b"*2\r\n$4\r\nECHO\r\n$1\r\nx\r\n").await;
        server.write_all(b"+PONG\r\n$1\r\nx\r\n").await.unwrap();
        assert_eq!(next.await.unwrap().unwrap(), Value::BulkString(Bytes::from_static(b"x")));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn eof_fails_pending_and_marks_broken() {
        let (client, mut server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("PING")).await })
        };
        read_some(&mut server, b"*1\r\n$4\r\nPING\r\n").await;
        drop(server);

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_connection_error(), "{:?}", err);
        assert!(conn.is_broken());
        assert!(conn.send(&Command::new("PING")).await.unwrap_err().is_connection_error());
    }

    #[tokio::test]
    async fn protocol_error_breaks_connection() {
        let (client, mut server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("PING")).await })
        };
        read_some(&mut server, b"*1\r\n$4\r\nPING\r\n").await;
        server.write_all(b"?garbage\r\n").await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(ClientError::Protocol { .. })));
    }

    #[tokio::test]
    async fn shutdown_fails_with_closing() {
        let (client, _server) = duplex(1024);
        let conn = NodeConnection::spawn(addr(), Box::new(client), CancellationToken::new());
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&Command::new("BLPOP").arg("q").arg("0")).await })
        };
        tokio::task::yield_now().await;
        conn.shutdown();
        assert!(matches!(task.await.unwrap(), Err(ClientError::Closing)));
        assert!(matches!(conn.send(&Command::new("PING")).await, Err(ClientError::Closing)));
    }
}
