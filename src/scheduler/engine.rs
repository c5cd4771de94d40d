use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::executor::{Job, JobOutcome};
use crate::runtime::{Inner, Runtime};
use crate::scheduler::broadcast;
use crate::task::CallbackAction;

/// Worker loop for one physical core.
///
/// Takes the next runnable task from the core's fifo, hands it to the
/// executor and publishes the completion. Parks on `wake` while the fifo has
/// nothing runnable or the core is powered down / clock gated. Exits on
/// shutdown or once the runtime has been dropped.
pub(crate) async fn run_core_worker(
    inner: Weak<Inner>,
    core: u32,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    debug!(core, "core worker started");

    loop {
        let Some(runtime) = Runtime::upgrade(&inner) else {
            break;
        };

        let next = runtime
            .with_state(|st, hooks| Ok(st.start_next(core, hooks)))
            .ok()
            .flatten();
        let job = match next {
            Some(job) => job,
            None => {
                drop(runtime);
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }
        };

        let executor = runtime.executor();
        let outcome = tokio::select! {
            outcome = executor.execute(&job) => outcome,
            _ = shutdown.cancelled() => break,
        };
        if let JobOutcome::Failed(reason) = &outcome {
            warn!(core, task = ?job.task, %reason, "job failed on core");
        }
        publish(&runtime, core, &job, outcome);
    }

    debug!(core, "core worker stopped");
}

/// Record a finished job and notify whoever observes it.
///
/// Status hooks and the completion callback run here, outside the lock. A
/// callback that panics counts as `Consumed`; the worker keeps serving.
fn publish(runtime: &Runtime, core: u32, job: &Job, outcome: JobOutcome) {
    let completion = runtime
        .with_state(|st, hooks| Ok(st.complete(core, job, outcome, hooks)))
        .ok()
        .flatten();
    let Some(done) = completion else {
        return;
    };

    broadcast(&done.notify);
    for index in &done.woken {
        runtime.wake_core(*index);
    }

    let Some(callback) = done.callback else {
        return;
    };
    let action = match panic::catch_unwind(AssertUnwindSafe(|| callback(done.task, done.status))) {
        Ok(action) => action,
        Err(_) => {
            warn!(core, task = ?done.task, "completion callback panicked");
            CallbackAction::Consumed
        }
    };
    if let Some(via) = done.reserved {
        runtime
            .lock()
            .settle(via, done.seq, action == CallbackAction::Forward);
    }
}
