use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::error;

/// Where user callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Each callback is a task on the tokio worker pool
    #[default]
    ThreadPool,
    /// Callbacks run one after another, in submission order, on a single task
    Serial,
}

/// Posts callbacks to the configured execution context.
///
/// Connections never run user code in-line with their own state changes;
/// everything user-facing goes through here.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    runtime: Handle,
    serial: Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

impl Dispatcher {
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(dispatch: Dispatch) -> Self {
        let runtime = Handle::current();
        let serial = match dispatch {
            Dispatch::ThreadPool => None,
            Dispatch::Serial => {
                let (queue, mut jobs) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
                runtime.spawn(async move {
                    while let Some(job) = jobs.recv().await {
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("callback panicked on the serial dispatcher");
                        }
                    }
                });
                Some(queue)
            }
        };
        Self { runtime, serial }
    }

    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.serial {
            Some(queue) => {
                let _ = queue.send(job.boxed());
            }
            None => {
                self.runtime.spawn(job);
            }
        }
    }

    pub(crate) fn dispatch_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(async move { f() });
    }
}
