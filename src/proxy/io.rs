//! Parallel fan-out/fan-in I/O combinators used when a connection has two
//! live remotes (primary + secondary share).

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ForwardError;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Reads from every live reader in parallel; the first to produce a
/// successful read is adopted exclusively for the remainder of the
/// connection's lifetime (the other remote is assumed to be the stale one
/// being phased out by a `share`/`promote` in progress).
pub struct MultiReader {
    readers: Vec<BoxedReader>,
}

impl MultiReader {
    pub fn new(readers: Vec<BoxedReader>) -> Self {
        MultiReader { readers }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.readers.len() == 1 {
            return self.readers[0].read(buf).await;
        }

        let mut readers = std::mem::take(&mut self.readers);
        let mut scratch: Vec<Vec<u8>> = readers.iter().map(|_| vec![0u8; buf.len()]).collect();

        let futs: Vec<_> = readers
            .iter_mut()
            .zip(scratch.iter_mut())
            .enumerate()
            .map(|(i, (reader, sbuf))| Box::pin(async move { (i, reader.read(sbuf).await) }))
            .collect();

        let mut pending = futs;
        let outcome = loop {
            let ((idx, result), _, remaining) = futures::future::select_all(pending).await;
            match result {
                Ok(n) => break Ok((idx, n)),
                Err(e) => {
                    if remaining.is_empty() {
                        break Err(e);
                    }
                    pending = remaining;
                }
            }
        };

        match outcome {
            Ok((idx, n)) => {
                buf[..n].copy_from_slice(&scratch[idx][..n]);
                self.readers = vec![readers.swap_remove(idx)];
                Ok(n)
            }
            Err(e) => {
                self.readers = readers;
                Err(e)
            }
        }
    }
}

/// Writes the same buffer to every live writer in parallel; succeeds if
/// any writer accepts the full buffer, pruning the ones that failed or
/// short-wrote so later calls don't keep paying for a dead remote.
pub struct MultiWriter {
    writers: Vec<BoxedWriter>,
}

impl MultiWriter {
    pub fn new(writers: Vec<BoxedWriter>) -> Self {
        MultiWriter { writers }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.writers.len() == 1 {
            return self.writers[0].write_all(buf).await;
        }

        let mut writers = std::mem::take(&mut self.writers);
        let results: Vec<io::Result<usize>> = {
            let futs = writers.iter_mut().map(|w| w.write(buf));
            futures::future::join_all(futs).await
        };

        let mut survivors = Vec::with_capacity(writers.len());
        let mut any_ok = false;
        for (writer, result) in writers.into_iter().zip(results) {
            if matches!(result, Ok(n) if n == buf.len()) {
                any_ok = true;
                survivors.push(writer);
            }
        }
        self.writers = survivors;

        if any_ok {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, ForwardError::WriteToAny))
        }
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_all_succeeds_if_any_writer_accepts_full_buffer() {
        let (mut a_r, a_w) = tokio::io::duplex(64);
        let (_b_r, b_w) = tokio::io::duplex(1); // tiny buffer, will short-write/err on large payload
        let mut mw = MultiWriter::new(vec![Box::new(a_w), Box::new(b_w)]);
        let payload = b"hello world, this is longer than one byte";
        let res = mw.write_all(payload).await;
        assert!(res.is_ok());
        let mut out = vec![0u8; payload.len()];
        let _ = tokio::io::AsyncReadExt::read_exact(&mut a_r, &mut out).await;
        assert_eq!(&out, payload);
    }

    #[tokio::test]
    async fn multi_reader_adopts_first_successful_reader() {
        let (mut a_w, a_r) = tokio::io::duplex(64);
        let (_b_w, b_r) = tokio::io::duplex(64);
        let mut mr = MultiReader::new(vec![Box::new(a_r), Box::new(b_r)]);
        tokio::io::AsyncWriteExt::write_all(&mut a_w, b"data").await.unwrap();
        let mut buf = [0u8; 4];
        let n = mr.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"data");
    }
}
