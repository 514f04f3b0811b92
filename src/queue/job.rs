//! Jobs and their terminal results.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::context::Context;
use crate::error::SharedError;

/// Scheduling lane of a job. Higher lanes are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Map a numeric 0-10 level onto a lane: 8 and above is high, 4 and
    /// above is normal.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        if level >= 8 {
            Priority::High
        } else if level >= 4 {
            Priority::Normal
        } else {
            Priority::Low
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The unit of work. Called once per attempt with a context that carries
/// the job timeout and queue shutdown.
pub type JobWork = Arc<dyn Fn(Context) -> JobFuture + Send + Sync>;

/// A unit of work submitted to a [`WorkQueue`](super::WorkQueue).
#[derive(Clone)]
pub struct Job {
    id: String,
    priority: Priority,
    attempt: u32,
    max_attempts: Option<u32>,
    work: JobWork,
}

impl Job {
    pub fn new<F, Fut>(id: impl Into<String>, priority: Priority, work: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority,
            attempt: 0,
            max_attempts: None,
            work: Arc::new(move |ctx| work(ctx).boxed()),
        }
    }

    /// Process one file. Normal priority, two retries.
    pub fn file_processing<F, Fut>(path: impl Into<PathBuf>, processor: F) -> Self
    where
        F: Fn(Context, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let path = path.into();
        let id = format!("file:{}", path.display());
        Self::new(id, Priority::from_level(5), move |ctx| processor(ctx, path.clone()))
            .with_max_retries(2)
    }

    /// Clone one repository. Normal priority, three retries.
    pub fn repository_clone<F, Fut>(url: impl Into<String>, cloner: F) -> Self
    where
        F: Fn(Context, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let url = url.into();
        let id = format!("clone:{url}");
        Self::new(id, Priority::from_level(7), move |ctx| cloner(ctx, url.clone()))
            .with_max_retries(3)
    }

    /// Override the queue's default retry budget for this job.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_attempts = Some(retries.saturating_add(1));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Own attempt budget, if the job carries one.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub(crate) fn start_attempt(&mut self, ctx: Context) -> JobFuture {
        self.attempt += 1;
        (self.work)(ctx)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Terminal outcome of one job. Every accepted job yields exactly one.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: Job,
    /// `None` on success.
    pub error: Option<SharedError>,
    /// Time spent in the final attempt.
    pub duration: Duration,
    /// True when the job needed more than one attempt.
    pub retried: bool,
    /// Set when the job never finished because the queue stopped.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
