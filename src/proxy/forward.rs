//! Bidirectional byte pipe between one local connection and one or two
//! remote connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::ForwardError;

use super::io::{BoxedReader, BoxedWriter, MultiReader, MultiWriter};

const BUF_SIZE: usize = 64 * 1024;

/// Inspects the first bytes of a just-forwarded chunk. Runs off the hot
/// path: the pipe loop hands it an owned snapshot and moves straight on to
/// the next read/write rather than waiting for this to return.
pub trait Matcher: Send + Sync {
    fn classify(&self, fconn: &ForwardConnection, islocal: bool, head: &[u8]);
}

pub trait Replacer: Send + Sync {
    fn replace(&self, buf: &[u8]) -> Vec<u8>;
}

pub struct ForwardConnection {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    closed: AtomicBool,
    close_signal: Notify,
    matcher: Option<Arc<dyn Matcher>>,
    replacer: Option<Arc<dyn Replacer>>,
    debug: bool,
}

impl ForwardConnection {
    fn new(matcher: Option<Arc<dyn Matcher>>, replacer: Option<Arc<dyn Replacer>>, debug: bool) -> Self {
        ForwardConnection {
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            matcher,
            replacer,
            debug,
        }
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
        }
    }

    /// Resolves once the connection has closed, used by the server to
    /// untrack it from its active-connection set.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    fn note_io_error(&self, e: &io::Error) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            debug!(error = %e, "forward connection eof");
        } else {
            warn!(error = %e, "forward connection error");
        }
        self.close();
    }

    fn record(&self, islocal: bool, n: u64) {
        if islocal {
            self.sent_bytes.fetch_add(n, Ordering::Relaxed);
        } else {
            self.received_bytes.fetch_add(n, Ordering::Relaxed);
        }
    }
}

#[async_trait]
trait ChunkReader: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkReader for R {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
trait ChunkWriter: Send {
    async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkWriter for W {
    async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }
}

#[async_trait]
impl ChunkReader for MultiReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }
}

#[async_trait]
impl ChunkWriter for MultiWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }
}

async fn pipe<S, D>(mut src: S, mut dst: D, islocal: bool, fconn: Arc<ForwardConnection>)
where
    S: ChunkReader,
    D: ChunkWriter,
{
    let mut buffers = [vec![0u8; BUF_SIZE], vec![0u8; BUF_SIZE]];
    let mut cur = 0usize;

    loop {
        if fconn.is_closed() {
            break;
        }
        let n = match src.read_chunk(&mut buffers[cur]).await {
            Ok(n) => n,
            Err(e) => {
                fconn.note_io_error(&e);
                break;
            }
        };
        if n == 0 {
            fconn.close();
            break;
        }

        let chunk: std::borrow::Cow<[u8]> = match &fconn.replacer {
            Some(r) => std::borrow::Cow::Owned(r.replace(&buffers[cur][..n])),
            None => std::borrow::Cow::Borrowed(&buffers[cur][..n]),
        };

        if fconn.debug {
            trace!(islocal, bytes = chunk.len(), "forwarding chunk");
        }

        if let Err(e) = dst.write_chunk(&chunk).await {
            fconn.note_io_error(&e);
            break;
        }
        fconn.record(islocal, n as u64);

        if let Some(matcher) = fconn.matcher.clone() {
            let head_len = n.min(4);
            let head = Bytes::copy_from_slice(&buffers[cur][..head_len]);
            let fconn2 = fconn.clone();
            tokio::spawn(async move {
                matcher.classify(&fconn2, islocal, &head);
            });
        }

        cur = 1 - cur;
    }
}

/// Dials every remote, wires up the two pipe directions, and runs until
/// either side closes. Connections are established fully before any bytes
/// flow: a failure to reach one remote fails the whole forward attempt.
pub async fn forward(
    local: TcpStream,
    remote_addrs: &[SocketAddr],
    matcher: Option<Arc<dyn Matcher>>,
    replacer: Option<Arc<dyn Replacer>>,
    no_delay: bool,
    debug: bool,
) -> Result<Arc<ForwardConnection>, ForwardError> {
    let mut remote_conns = Vec::with_capacity(remote_addrs.len());
    for addr in remote_addrs {
        let conn = TcpStream::connect(addr)
            .await
            .map_err(|e| ForwardError::Connect { addr: *addr, source: e })?;
        if no_delay {
            let _ = conn.set_nodelay(true);
        }
        remote_conns.push(conn);
    }
    if no_delay {
        let _ = local.set_nodelay(true);
    }

    let fconn = Arc::new(ForwardConnection::new(matcher, replacer, debug));

    let (local_r, local_w) = tokio::io::split(local);
    let mut remote_readers: Vec<BoxedReader> = Vec::with_capacity(remote_conns.len());
    let mut remote_writers: Vec<BoxedWriter> = Vec::with_capacity(remote_conns.len());
    for conn in remote_conns {
        let (r, w) = tokio::io::split(conn);
        remote_readers.push(Box::new(r));
        remote_writers.push(Box::new(w));
    }

    let mut to_remote = {
        let fconn = fconn.clone();
        let writer = MultiWriter::new(remote_writers);
        tokio::spawn(pipe(local_r, writer, true, fconn))
    };
    let mut from_remote = {
        let fconn = fconn.clone();
        let reader = MultiReader::new(remote_readers);
        tokio::spawn(pipe(reader, local_w, false, fconn))
    };

    // Either direction finishing (close, EOF, or error) tears down the
    // other: a blocked read on the surviving half won't notice `close()`
    // on its own, so abort it explicitly.
    tokio::select! {
        _ = &mut to_remote => { from_remote.abort(); }
        _ = &mut from_remote => { to_remote.abort(); }
    }
    fconn.close();

    Ok(fconn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct NoopMatcher;
    impl Matcher for NoopMatcher {
        fn classify(&self, _fconn: &ForwardConnection, _islocal: bool, _head: &[u8]) {}
    }

    #[tokio::test]
    async fn forwards_bytes_between_local_and_single_remote() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut sock, _)) = remote_listener.accept().await {
                let mut buf = [0u8; 5];
                let _ = sock.read_exact(&mut buf).await;
                let _ = sock.write_all(b"world").await;
            }
        });

        let connector_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connector_addr = connector_listener.local_addr().unwrap();

        let server_side = tokio::spawn(async move {
            let (sock, _) = connector_listener.accept().await.unwrap();
            forward(sock, &[remote_addr], Some(Arc::new(NoopMatcher)), None, true, false)
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(connector_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"world");

        drop(client);
        let _ = server_side.await;
    }
}
