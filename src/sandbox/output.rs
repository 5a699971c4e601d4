//! Concurrent, capped capture of a child's output streams.
//!
//! Reading stdout/stderr only after the child exits deadlocks once the child
//! fills a pipe, so each stream gets its own reader thread. Readers keep
//! draining after the cap is hit; excess bytes are counted and dropped so
//! the child never blocks on a full pipe.

use std::io::Read;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

const CHUNK_SIZE: usize = 8 * 1024;

/// Bytes captured from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    /// Retained output, at most the configured cap.
    pub bytes: Vec<u8>,
    /// True if output beyond the cap was discarded.
    pub truncated: bool,
    /// Total bytes the child wrote, including discarded ones.
    pub total: u64,
}

impl CapturedStream {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.total += chunk.len() as u64;
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Background reader draining one pipe into a shared buffer.
pub(crate) struct StreamReader {
    name: &'static str,
    buffer: Arc<Mutex<CapturedStream>>,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Starts draining `source`, keeping at most `limit` bytes.
    pub(crate) fn spawn<R>(name: &'static str, source: Option<R>, limit: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CapturedStream::default()));
        let (tx, done) = mpsc::channel();
        let shared = Arc::clone(&buffer);

        let join = thread::spawn(move || {
            if let Some(mut reader) = source {
                let mut chunk = [0u8; CHUNK_SIZE];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(&chunk[..n], limit),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            trace!(stream = name, error = %e, "Output stream read failed");
                            break;
                        }
                    }
                }
            }
            let _ = tx.send(());
        });

        Self {
            name,
            buffer,
            done,
            join: Some(join),
        }
    }

    /// Waits until `deadline` for the stream to close, then snapshots it.
    ///
    /// A grandchild that escaped the process group can hold the pipe open
    /// forever; in that case the reader is abandoned and whatever was
    /// captured so far is returned.
    pub(crate) fn finish(mut self, deadline: Instant) -> CapturedStream {
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(stream = self.name, "Output stream still open after process exit");
            }
        }

        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// How long readers get to drain after the process group is gone.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_push_caps_and_counts() {
        let mut stream = CapturedStream::default();
        stream.push(b"hello", 8);
        assert!(!stream.truncated);
        stream.push(b" world", 8);

        assert_eq!(stream.bytes, b"hello wo");
        assert!(stream.truncated);
        assert_eq!(stream.total, 11);
    }

    #[test]
    fn test_reader_drains_past_limit() {
        let data = vec![b'x'; 3 * CHUNK_SIZE + 17];
        let reader = StreamReader::spawn("stdout", Some(Cursor::new(data)), 100);

        let captured = reader.finish(Instant::now() + Duration::from_secs(5));
        assert_eq!(captured.bytes.len(), 100);
        assert!(captured.truncated);
        assert_eq!(captured.total, (3 * CHUNK_SIZE + 17) as u64);
    }

    #[test]
    fn test_reader_without_source() {
        let reader = StreamReader::spawn::<Cursor<Vec<u8>>>("stderr", None, 100);
        let captured = reader.finish(Instant::now() + Duration::from_secs(5));
        assert_eq!(captured, CapturedStream::default());
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let reader = StreamReader::spawn("stdout", Some(Cursor::new(vec![1u8; 64])), 64);
        let captured = reader.finish(Instant::now() + Duration::from_secs(5));
        assert_eq!(captured.bytes.len(), 64);
        assert!(!captured.truncated);
    }
}
