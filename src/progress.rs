//! Progress counter for fan-out of asynchronous operations
//!
//! A counter starts with one outstanding job (the operation that created it).
//! Every `wait()` must be matched by one `done()`; when the counts meet, the
//! completion callback fires and `finished()` resolves, exactly once, with the
//! number of extra jobs that were completed.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};

type Callback = Box<dyn FnOnce(usize)>;

struct Counter {
    job_count: usize,
    jobs_done: usize,
    finished: bool,
    callback: Option<Callback>,
    waiters: Vec<oneshot::Sender<usize>>,
}

/// Shared job counter handle. Clones refer to the same counter.
///
/// `Progress::null()` (also the `Default`) ignores all calls and reports 100%.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Option<Rc<RefCell<Counter>>>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            inner: Some(Rc::new(RefCell::new(Counter {
                job_count: 1,
                jobs_done: 0,
                finished: false,
                callback: None,
                waiters: Vec::new(),
            }))),
        }
    }

    /// Create a counter that calls `callback` with the completed job count.
    pub fn with_callback(callback: impl FnOnce(usize) + 'static) -> Self {
        let progress = Self::new();
        if let Some(inner) = &progress.inner {
            inner.borrow_mut().callback = Some(Box::new(callback));
        }
        progress
    }

    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Add `jobs` outstanding jobs.
    pub fn wait(&self, jobs: usize) {
        if let Some(inner) = &self.inner {
            inner.borrow_mut().job_count += jobs;
        }
    }

    /// Mark `jobs` jobs as completed.
    pub fn done(&self, jobs: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (callback, waiters, completed) = {
            let mut counter = inner.borrow_mut();
            counter.jobs_done += jobs;
            if counter.finished || counter.jobs_done != counter.job_count {
                return;
            }
            counter.finished = true;
            let completed = counter.job_count - 1;
            (
                counter.callback.take(),
                std::mem::take(&mut counter.waiters),
                completed,
            )
        };
        if let Some(callback) = callback {
            callback(completed);
        }
        for waiter in waiters {
            let _ = waiter.send(completed);
        }
    }

    /// Percentage of completed jobs, 0.0 to 100.0.
    pub fn progress(&self) -> f64 {
        match &self.inner {
            Some(inner) => {
                let counter = inner.borrow();
                100.0 * counter.jobs_done as f64 / counter.job_count as f64
            }
            None => 100.0,
        }
    }

    /// Jobs completed so far.
    pub fn count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.borrow().jobs_done)
    }

    /// Total jobs, including the implicit first job.
    pub fn total_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.borrow().job_count)
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.borrow().finished)
    }

    /// Resolves once all jobs are done, with the number of extra jobs completed.
    pub fn finished(&self) -> LocalBoxFuture<'static, usize> {
        let Some(inner) = &self.inner else {
            return future::ready(0).boxed_local();
        };
        let mut counter = inner.borrow_mut();
        if counter.finished {
            return future::ready(counter.job_count - 1).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        counter.waiters.push(tx);
        rx.map(|result| result.unwrap_or(0)).boxed_local()
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => {
                let counter = inner.borrow();
                f.debug_struct("Progress")
                    .field("job_count", &counter.job_count)
                    .field("jobs_done", &counter.jobs_done)
                    .field("finished", &counter.finished)
                    .finish()
            }
            None => f.write_str("Progress(null)"),
        }
    }
}
