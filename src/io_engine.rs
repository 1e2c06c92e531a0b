//! C6: the async-I/O engine binding. All swap traffic is page-sized reads
//! and writes against a swap file, submitted to a small pool of worker
//! threads and awaited with a fixed 120-second timeout.
//!
//! The pool's own concurrency model is plain OS threads, so "async" here
//! means "handed off to a worker and awaited", not `async`/`await`; the
//! one-shot reply channel plus `recv_timeout` gives callers exactly a
//! `Completed | TimedOut | SubmitFailed` outcome to react to.

use crate::config::IO_TIMEOUT_SECS;
use crate::deps::log::{debug, warn};
use crate::deps::parking_lot::Mutex;
use crate::sid::Sid;
use crate::swapfile::SwapFileManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

pub enum IoOutcome {
    Completed,
    TimedOut,
    SubmitFailed,
}

enum Job {
    Read { sid: Sid, buf: Vec<u8>, reply: Sender<Result<Vec<u8>, std::io::Error>> },
    Write { sid: Sid, buf: Vec<u8>, reply: Sender<Result<(), std::io::Error>> },
    Shutdown,
}

/// A small fixed-size worker-thread pool that performs blocking positioned
/// reads/writes on swap files.
pub struct IoEngine {
    tx: Sender<Job>,
    workers: Vec<std::thread::JoinHandle<()>>,
    /// Test-only fault injection for the rollback paths in `crate::pool`.
    fail_writes: Arc<AtomicBool>,
}

impl IoEngine {
    pub fn new(files: Arc<SwapFileManager>, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let fail_writes = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let files = Arc::clone(&files);
            let fail_writes = Arc::clone(&fail_writes);
            workers.push(std::thread::spawn(move || Self::worker_loop(rx, files, fail_writes)));
        }
        Self { tx, workers, fail_writes }
    }

    /// Forces every subsequent write to fail without touching the
    /// underlying file, so callers can exercise eviction rollback.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, files: Arc<SwapFileManager>, fail_writes: Arc<AtomicBool>) {
        loop {
            let job = {
                let guard = rx.lock();
                guard.recv()
            };
            match job {
                Ok(Job::Read { sid, mut buf, reply }) => {
                    let result = files.read_at(sid, &mut buf).map(|_| buf);
                    let _ = reply.send(result);
                }
                Ok(Job::Write { sid, buf, reply }) => {
                    let result = if fail_writes.load(Ordering::SeqCst) {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"))
                    } else {
                        files.write_at(sid, &buf)
                    };
                    let _ = reply.send(result);
                }
                Ok(Job::Shutdown) | Err(_) => break,
            }
        }
    }

    /// Reads `page_size` bytes from `sid`'s swap page. On success, fills
    /// `buf`. A timeout or submit failure leaves `sid` untouched -- the
    /// caller's data must remain recoverable on retry.
    pub fn read_page(&self, sid: Sid, buf: &mut [u8]) -> IoOutcome {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(Job::Read { sid, buf: vec![0u8; buf.len()], reply: reply_tx }).is_err() {
            warn!("[IoEngine::read_page] submit failed: worker pool is gone");
            return IoOutcome::SubmitFailed;
        }
        match reply_rx.recv_timeout(Duration::from_secs(IO_TIMEOUT_SECS)) {
            Ok(Ok(data)) => {
                buf.copy_from_slice(&data);
                IoOutcome::Completed
            }
            Ok(Err(e)) => {
                debug!("[IoEngine::read_page] read of {:?} failed: {}", sid, e);
                IoOutcome::SubmitFailed
            }
            Err(mpsc::RecvTimeoutError::Timeout) => IoOutcome::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => IoOutcome::SubmitFailed,
        }
    }

    /// Writes `buf` to `sid`'s swap page.
    pub fn write_page(&self, sid: Sid, buf: &[u8]) -> IoOutcome {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(Job::Write { sid, buf: buf.to_vec(), reply: reply_tx }).is_err() {
            warn!("[IoEngine::write_page] submit failed: worker pool is gone");
            return IoOutcome::SubmitFailed;
        }
        match reply_rx.recv_timeout(Duration::from_secs(IO_TIMEOUT_SECS)) {
            Ok(Ok(())) => IoOutcome::Completed,
            Ok(Err(e)) => {
                debug!("[IoEngine::write_page] write of {:?} failed: {}", sid, e);
                IoOutcome::SubmitFailed
            }
            Err(mpsc::RecvTimeoutError::Timeout) => IoOutcome::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => IoOutcome::SubmitFailed,
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.tx.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("vmpool-io-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn write_then_read_through_the_engine() {
        let files = Arc::new(SwapFileManager::new(4096));
        let path = tmp_path("engine-rw");
        files.add_file(path.clone(), 8 * 1024 * 1024).unwrap();
        let sid = files.alloc_page();

        let engine = IoEngine::new(Arc::clone(&files), 2);
        let pattern = vec![0x5A_u8; 4096];
        assert!(matches!(engine.write_page(sid, &pattern), IoOutcome::Completed));

        let mut out = vec![0u8; 4096];
        assert!(matches!(engine.read_page(sid, &mut out), IoOutcome::Completed));
        assert_eq!(out, pattern);

        std::fs::remove_file(path).ok();
    }
}
