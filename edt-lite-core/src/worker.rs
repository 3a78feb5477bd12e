use crate::guid::{Guid, NULL_GUID};
use crate::pd::PolicyDomain;
use crate::task::{self, Task};
use crate::trace::{TraceAction, TraceType};
use std::cell::RefCell;
use std::sync::Arc;

/// What `getCurrentEnv` answers: the policy domain, the worker, and the
/// task currently executing on this thread (if any).
#[derive(Clone)]
pub struct CurrentEnv {
    pub pd: Arc<PolicyDomain>,
    pub worker: u32,
    pub task: Option<Arc<Task>>,
}

thread_local! {
    static ENV: RefCell<Option<CurrentEnv>> = const { RefCell::new(None) };
}

/// The environment accessor. Deep call paths use it to tag messages with
/// the issuing task and to reach the domain without threading a handle.
pub fn current_env() -> Option<CurrentEnv> {
    ENV.with(|e| e.borrow().clone())
}

pub fn current_task() -> Option<Arc<Task>> {
    ENV.with(|e| e.borrow().as_ref().and_then(|env| env.task.clone()))
}

pub fn current_task_guid() -> Guid {
    current_task().map(|t| t.guid).unwrap_or(NULL_GUID)
}

pub fn current_worker() -> u32 {
    ENV.with(|e| e.borrow().as_ref().map(|env| env.worker).unwrap_or(u32::MAX))
}

/// Install the environment for the duration of `f`. The region must not
/// yield: the worker loop only wraps synchronous execution in it.
pub fn with_env<R>(
    pd: &Arc<PolicyDomain>,
    worker: u32,
    task: Option<Arc<Task>>,
    f: impl FnOnce() -> R,
) -> R {
    let prev = ENV.with(|e| {
        e.borrow_mut().replace(CurrentEnv {
            pd: pd.clone(),
            worker,
            task,
        })
    });
    let out = f();
    ENV.with(|e| {
        *e.borrow_mut() = prev;
    });
    out
}

/// One worker: drain ready tasks, park on the scheduler's notifier, exit
/// when the COMPUTE_OK tear-down stops the domain. Check-ins pair with the
/// phases the runtime arms on the shared switch record.
pub async fn worker_loop(pd: Arc<PolicyDomain>, worker: u32) {
    tracing::debug!(location = pd.location(), worker, "worker online");
    pd.trace
        .emit(TraceType::Worker, TraceAction::Create, worker, NULL_GUID, NULL_GUID);
    pd.rl_switch.checkin();
    let mut stop = pd.stop_watch();
    loop {
        while let Some(t) = pd.scheduler.take(worker) {
            pd.trace.emit(
                TraceType::Task,
                TraceAction::ExecuteBegin,
                worker,
                NULL_GUID,
                t.guid,
            );
            let result = with_env(&pd, worker, Some(t.clone()), || task::execute(&pd, &t));
            pd.trace.emit(
                TraceType::Task,
                TraceAction::ExecuteEnd,
                worker,
                NULL_GUID,
                t.guid,
            );
            if let Err(e) = result {
                tracing::error!(task = %t.guid, err = %e, "task execution failed");
            }
        }
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = pd.scheduler.notifier().notified() => {}
            _ = stop.changed() => {}
        }
    }
    tracing::debug!(location = pd.location(), worker, "worker offline");
    pd.trace
        .emit(TraceType::Worker, TraceAction::Destroy, worker, NULL_GUID, NULL_GUID);
    pd.rl_switch.checkin();
}

/// The transport pump: one per domain, feeding inbound messages to the
/// router. Runs without a worker identity.
pub async fn comm_pump(pd: Arc<PolicyDomain>) {
    while let Some(msg) = pd.transport.next().await {
        with_env(&pd, u32::MAX, None, || pd.process_incoming(msg));
    }
    tracing::debug!(location = pd.location(), "transport pump drained");
}

/// Optional system worker: periodically drains the trace buffer into the
/// shared sink so long runs do not accumulate records unboundedly.
pub async fn system_worker(
    pd: Arc<PolicyDomain>,
    sink: Arc<spin::Mutex<Vec<crate::trace::TraceRecord>>>,
) {
    let mut stop = pd.stop_watch();
    loop {
        let records = pd.trace.drain();
        if !records.is_empty() {
            sink.lock().extend(records);
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() {
            break;
        }
    }
    let records = pd.trace.drain();
    if !records.is_empty() {
        sink.lock().extend(records);
    }
}
