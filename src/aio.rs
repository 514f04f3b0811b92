//! Asynchronous file and HTTP operations with bounded concurrency.
//!
//! Each operation runs on its own task and hands back a [`Completion`]
//! that resolves once with the outcome. At most `concurrency` operations
//! run at a time; the rest wait for a permit. HTTP requests go through
//! the [`ConnectionManager`] when one is attached, so retries come from
//! there rather than from this module.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Request};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::connection::ConnectionManager;
use crate::context::Context;
use crate::error::{ConnectionError, Error, ExecutionError, Result};
use crate::stats::Ema;

/// Resolves once with the outcome of a spawned operation.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ExecutionError::Abandoned.into())))
    }
}

/// Outcome of one read in [`AsyncIo::batch_read_files`].
#[derive(Debug)]
pub struct FileResult {
    pub path: PathBuf,
    pub result: Result<Vec<u8>>,
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub total_operations: u64,
    pub completed_ops: u64,
    pub failed_ops: u64,
    pub average_latency: Duration,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    latency: Ema,
}

struct Inner {
    permits: Semaphore,
    connection: Option<Arc<ConnectionManager>>,
    client: Client,
    counters: Counters,
}

/// Bounded-concurrency async I/O. Cheap to clone.
#[derive(Clone)]
pub struct AsyncIo {
    inner: Arc<Inner>,
}

impl AsyncIo {
    /// Must be called inside a tokio runtime; operations are spawned onto it.
    ///
    /// # Errors
    ///
    /// Fails when no manager is attached and a plain client cannot be built.
    pub fn new(concurrency: usize, connection: Option<Arc<ConnectionManager>>) -> Result<Self> {
        let client = match &connection {
            Some(manager) => manager.client().clone(),
            None => Client::builder()
                .build()
                .map_err(|err| ConnectionError::Client(err.to_string()))?,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(concurrency.max(1)),
                connection,
                client,
                counters: Counters::default(),
            }),
        })
    }

    fn spawn<T, Fut>(&self, ctx: &Context, op: &'static str, fut: Fut) -> Completion<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let ctx = ctx.clone();
        inner.counters.total.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let started = Instant::now();
            let result = async {
                let _permit = ctx
                    .run(inner.permits.acquire())
                    .await?
                    .map_err(|_| ExecutionError::Abandoned)?;
                ctx.run(fut).await?
            }
            .await;

            let counter = if result.is_ok() {
                &inner.counters.completed
            } else {
                &inner.counters.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
            inner.counters.latency.record(started.elapsed());
            trace!(op, ok = result.is_ok(), elapsed_us = started.elapsed().as_micros() as u64, "io operation finished");
            let _ = tx.send(result);
        });

        Completion { rx }
    }

    pub fn read_file(&self, ctx: &Context, path: impl AsRef<Path>) -> Completion<Vec<u8>> {
        let path = path.as_ref().to_path_buf();
        self.spawn(ctx, "read_file", async move {
            Ok::<_, Error>(tokio::fs::read(&path).await?)
        })
    }

    /// Write `data` to `path`, creating missing parent directories.
    pub fn write_file(
        &self,
        ctx: &Context,
        path: impl AsRef<Path>,
        data: impl Into<Vec<u8>>,
    ) -> Completion<()> {
        let path = path.as_ref().to_path_buf();
        let data = data.into();
        self.spawn(ctx, "write_file", async move {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data).await?;
            Ok::<_, Error>(())
        })
    }

    /// Send `request` and read the whole body.
    pub fn http_request(&self, ctx: &Context, request: Request) -> Completion<HttpResponse> {
        let connection = self.inner.connection.clone();
        let client = self.inner.client.clone();
        let request_ctx = ctx.clone();
        self.spawn(ctx, "http_request", async move {
            let response = match connection {
                Some(manager) => manager.do_with_retry(&request_ctx, request).await?,
                None => client
                    .execute(request)
                    .await
                    .map_err(ConnectionError::Transport)?,
            };
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(ConnectionError::Transport)?
                .to_vec();
            Ok::<_, Error>(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }

    /// Read every path concurrently. Results arrive in completion order and
    /// the stream ends after the last one.
    pub fn batch_read_files(
        &self,
        ctx: &Context,
        paths: Vec<PathBuf>,
    ) -> mpsc::Receiver<FileResult> {
        let (tx, rx) = mpsc::channel(paths.len().max(1));
        for path in paths {
            let completion = self.read_file(ctx, &path);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = completion.await;
                let _ = tx.send(FileResult { path, result }).await;
            });
        }
        rx
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        let counters = &self.inner.counters;
        IoStats {
            total_operations: counters.total.load(Ordering::Relaxed),
            completed_ops: counters.completed.load(Ordering::Relaxed),
            failed_ops: counters.failed.load(Ordering::Relaxed),
            average_latency: counters.latency.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;
    use crate::testkit::{self, ScriptedResponse, ScriptedServer};

    #[tokio::test]
    async fn test_write_creates_parents_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.txt");
        let io = AsyncIo::new(2, None).unwrap();
        let ctx = Context::background();

        io.write_file(&ctx, &path, "payload").await.unwrap();
        let data = io.read_file(&ctx, &path).await.unwrap();
        assert_eq!(data, b"payload");

        let stats = io.stats();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.completed_ops, 2);
        assert_eq!(stats.failed_ops, 0);
    }

    #[tokio::test]
    async fn test_missing_file_counts_failure() {
        let dir = tempfile::tempdir().unwrap();
        let io = AsyncIo::new(1, None).unwrap();
        let err = io
            .read_file(&Context::background(), dir.path().join("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(io.stats().failed_ops, 1);
    }

    #[tokio::test]
    async fn test_batch_read_streams_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..6 {
            let path = dir.path().join(format!("f{i}.txt"));
            std::fs::write(&path, format!("file {i}")).unwrap();
            paths.push(path);
        }
        paths.push(dir.path().join("missing.txt"));

        let io = AsyncIo::new(2, None).unwrap();
        let mut rx = io.batch_read_files(&Context::background(), paths);
        let mut ok = 0;
        let mut failed = 0;
        while let Some(file) = rx.recv().await {
            match file.result {
                Ok(data) => {
                    assert!(String::from_utf8(data).unwrap().starts_with("file "));
                    ok += 1;
                }
                Err(_) => {
                    assert!(file.path.ends_with("missing.txt"));
                    failed += 1;
                }
            }
        }
        assert_eq!((ok, failed), (6, 1));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let io = AsyncIo::new(1, None).unwrap();
        let ctx = Context::background();
        ctx.cancel();
        let err = io.read_file(&ctx, "/dev/null").await.unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::Canceled)));
    }

    #[tokio::test]
    async fn test_http_request_goes_through_connection_manager() {
        let server = ScriptedServer::start(vec![
            ScriptedResponse::status(503),
            ScriptedResponse::ok("{\"ok\":true}").with_header("content-type", "application/json"),
        ])
        .await
        .unwrap();
        let manager = Arc::new(ConnectionManager::new(testkit::config::connection(2)).unwrap());
        let io = AsyncIo::new(4, Some(manager.clone())).unwrap();

        let request = manager.client().get(server.url("/status")).build().unwrap();
        let response = io
            .http_request(&Context::background(), request)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.text(), "{\"ok\":true}");
        assert_eq!(response.headers["content-type"], "application/json");
        assert_eq!(manager.stats().retry_attempts, 1);
    }

    #[tokio::test]
    async fn test_http_without_manager_uses_plain_client_once() {
        let server = ScriptedServer::start(vec![
            ScriptedResponse::status(503),
            ScriptedResponse::ok("late"),
        ])
        .await
        .unwrap();
        let io = AsyncIo::new(1, None).unwrap();

        let request = Client::new().get(server.url("/once")).build().unwrap();
        let response = io
            .http_request(&Context::background(), request)
            .await
            .unwrap();
        assert!(!response.is_success());
        assert_eq!(server.requests(), 1);
    }
}
