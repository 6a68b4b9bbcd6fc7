//! Output correlator: concurrent error-stream capture.
//!
//! Buffers a target's stderr into a bounded ring while the signal
//! interception layer watches the process, so diagnostic output printed
//! just before death (handler messages, runtime tracebacks) can be
//! correlated with the captured fatal event afterwards.
//!
//! The drain never blocks or slows the target's own writes: it runs on
//! its own blocking task, pulling from the pipe as bytes arrive. The
//! snapshot is only obtainable through [`OutputCorrelator::finalize`],
//! which the session task calls after termination is confirmed — the
//! read happens-after the write side is done, never racing a truncated
//! in-flight write.

use std::io::Read;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::byte_ring::ByteRing;

/// Drain-loop poll cadence while the target is alive.
const POLL_TIMEOUT_MS: u16 = 100;

/// Bound on the final sweep when capture is cut short (detach/timeout
/// with the target still alive and possibly still writing).
const FINAL_SWEEP_BYTES: usize = 256 * 1024;

const READ_CHUNK: usize = 4096;

/// Finalized capture of a target's error stream.
///
/// Append-only while the target ran; immutable here. Associated with
/// exactly one target.
#[derive(Debug)]
pub struct ErrorStreamSnapshot {
    ring: ByteRing,
}

impl ErrorStreamSnapshot {
    /// An empty snapshot, for targets with no owned stderr.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ring: ByteRing::new(1),
        }
    }

    /// Whether anything was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Bytes retained (post-eviction).
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Total bytes the target wrote, including evicted ones.
    #[must_use]
    pub fn total_seen(&self) -> u64 {
        self.ring.total_seen()
    }

    /// Whether the capture bound dropped older output.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.ring.truncated()
    }

    /// Tail excerpt trimmed to whole lines, or `None` when empty.
    #[must_use]
    pub fn excerpt(&self, max_bytes: usize) -> Option<String> {
        if self.ring.is_empty() {
            None
        } else {
            Some(self.ring.tail_excerpt(max_bytes))
        }
    }
}

/// Handle for one in-flight capture.
#[derive(Debug)]
pub struct OutputCorrelator {
    handle: JoinHandle<ByteRing>,
    stop: Arc<AtomicBool>,
}

impl OutputCorrelator {
    /// Start draining `stream` into a ring bounded at `cap_bytes`.
    pub fn begin_capture<R>(stream: R, cap_bytes: usize) -> Self
    where
        R: Read + AsFd + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_inner = Arc::clone(&stop);
        let handle =
            tokio::task::spawn_blocking(move || drain_loop(stream, cap_bytes, &stop_inner));
        Self { handle, stop }
    }

    /// Finish the capture and hand over the snapshot.
    ///
    /// Call only after termination is confirmed; the drain is given a
    /// chance to pull already-buffered bytes, then the snapshot is
    /// sealed. When the target is in fact still alive (detach/timeout
    /// teardown) the sweep is bounded instead of chasing the stream.
    pub async fn finalize(self) -> ErrorStreamSnapshot {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.await {
            Ok(ring) => ErrorStreamSnapshot { ring },
            Err(err) => {
                debug!(%err, "stderr drain task failed; snapshot empty");
                ErrorStreamSnapshot::empty()
            }
        }
    }
}

/// Blocking drain: poll-then-read until EOF or a stop request.
fn drain_loop<R>(mut stream: R, cap_bytes: usize, stop: &AtomicBool) -> ByteRing
where
    R: Read + AsFd,
{
    let mut ring = ByteRing::new(cap_bytes.max(1));
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if stop.load(Ordering::SeqCst) {
            final_sweep(&mut stream, &mut ring, &mut buf);
            return ring;
        }
        let ready = {
            let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS))
        };
        match ready {
            Ok(0) => {} // idle; re-check the stop flag
            Ok(_) => match stream.read(&mut buf) {
                Ok(0) => return ring, // EOF: writer side fully closed
                Ok(n) => ring.extend(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(%err, "stderr read failed; capture ends");
                    return ring;
                }
            },
            Err(Errno::EINTR) => {}
            Err(errno) => {
                debug!(%errno, "stderr poll failed; capture ends");
                return ring;
            }
        }
    }
}

/// Pull whatever is already buffered without waiting, bounded so a
/// still-live writer cannot pin the drain forever.
fn final_sweep<R>(stream: &mut R, ring: &mut ByteRing, buf: &mut [u8])
where
    R: Read + AsFd,
{
    let mut swept = 0usize;
    while swept < FINAL_SWEEP_BYTES {
        let ready = {
            let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::ZERO)
        };
        match ready {
            Ok(n) if n > 0 => match stream.read(buf) {
                Ok(0) => return,
                Ok(n) => {
                    swept += n;
                    ring.extend(&buf[..n]);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return,
            },
            Err(Errno::EINTR) => {}
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    fn pipe_pair() -> (File, File) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe");
        (File::from(read_fd), File::from(write_fd))
    }

    #[tokio::test]
    async fn captures_until_eof() {
        let (read_end, mut write_end) = pipe_pair();
        let correlator = OutputCorrelator::begin_capture(read_end, 1024);
        write_end.write_all(b"diagnostic line\n").expect("write");
        drop(write_end); // EOF
        let snapshot = correlator.finalize().await;
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.excerpt(1024).as_deref(), Some("diagnostic line\n"));
        assert!(!snapshot.truncated());
    }

    #[tokio::test]
    async fn bounded_capture_keeps_tail() {
        let (read_end, mut write_end) = pipe_pair();
        let correlator = OutputCorrelator::begin_capture(read_end, 16);
        write_end.write_all(b"0123456789").expect("write");
        write_end.write_all(b"abcdefghij").expect("write");
        drop(write_end);
        let snapshot = correlator.finalize().await;
        assert_eq!(snapshot.len(), 16);
        assert_eq!(snapshot.total_seen(), 20);
        assert!(snapshot.truncated());
        let excerpt = snapshot.excerpt(64).expect("excerpt");
        assert!(excerpt.ends_with("abcdefghij"));
    }

    #[tokio::test]
    async fn finalize_with_live_writer_returns() {
        let (read_end, mut write_end) = pipe_pair();
        let correlator = OutputCorrelator::begin_capture(read_end, 1024);
        write_end.write_all(b"partial").expect("write");
        // Writer stays open: finalize must still complete via the
        // bounded sweep.
        let snapshot = correlator.finalize().await;
        assert_eq!(snapshot.excerpt(64).as_deref(), Some("partial"));
        drop(write_end);
    }

    #[test]
    fn empty_snapshot_has_no_excerpt() {
        let snapshot = ErrorStreamSnapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.excerpt(64), None);
    }
}
