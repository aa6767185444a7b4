//! Fixed worker pool for the query pipeline.
//!
//! Dense and sparse searches run here concurrently; the rerank stage
//! uses the same pool for its blocking HTTP call. Each worker keeps
//! its own SQLite handle (opened from the workspace path and cached
//! per thread), so concurrent reads never share a connection.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use rusqlite::Connection;

use crate::db;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool sized to `max(2, available cores / 2)`.
    pub fn with_default_size() -> Result<Self> {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new((cores / 2).max(2))
    }

    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("folio-worker-{i}"))
                .spawn(move || loop {
                    let job = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .context("spawn worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Runs `f` on the pool and returns a receiver for its result:
    /// future-style completion without an async runtime.
    pub fn run<T, F>(&self, f: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        if let Some(sender) = &self.sender {
            let submitted = sender.send(Box::new(move || {
                let _ = tx.send(f());
            }));
            if submitted.is_err() {
                tracing::warn!("worker pool is shut down; job dropped");
            }
        }
        rx
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

thread_local! {
    static WORKER_DB: RefCell<Option<(PathBuf, Connection)>> = const { RefCell::new(None) };
}

/// Runs `f` against this thread's own read handle for `path`, opening
/// (or re-opening after a workspace switch) on first use.
pub fn with_worker_conn<T>(path: &Path, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    WORKER_DB.with(|cell| {
        let mut slot = cell.borrow_mut();

        let reopen = match slot.as_ref() {
            Some((cached, _)) => cached != path,
            None => true,
        };
        if reopen {
            let conn = db::open(path)?;
            *slot = Some((path.to_path_buf(), conn));
        }

        match slot.as_ref() {
            Some((_, conn)) => f(conn),
            None => Err(anyhow!("worker connection unavailable")),
        }
    })
}
