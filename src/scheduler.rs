//! Ready-queue management, bounded-concurrency dispatch, and body execution
//! (§4.5).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_channel::oneshot;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::clock::LogicalClock;
use crate::computation::Transition;
use crate::ids::{CompKey, VarKey};
use crate::kernel::{Inner, KernelHandle, Scope};
use crate::result::CellResult;
use crate::task::{Aborted, CancelToken, TaskHandle};
use crate::value::values_equal;

pub(crate) type LocalBoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// The kernel's spawned-task pool, split into an `active` set currently
/// being polled and a `spawned` staging list that freshly-spawned futures
/// land in instead. A computation body awaited from inside a poll of
/// `active` (via the scope proxy's `evaluate`) can itself cause a producer
/// to be spawned; if that producer were pushed straight into `active`, the
/// push would need to reborrow the very `FuturesUnordered` already mutably
/// borrowed by the in-progress `poll_next` call. Staging it in `spawned`
/// instead, and promoting `spawned` into `active` only between `poll_next`
/// calls, keeps that reborrow from ever happening while also guaranteeing a
/// producer spawned mid-drain is driven in the *same* `run_until_idle` pass
/// as its consumer (rather than left for a separate batch that never gets
/// polled until the first one finishes — the nested-pull livelock this
/// pool exists to avoid).
#[derive(Default)]
pub(crate) struct TaskPool {
    active: RefCell<FuturesUnordered<LocalBoxFuture>>,
    spawned: RefCell<Vec<LocalBoxFuture>>,
}

impl TaskPool {
    fn spawn(&self, fut: LocalBoxFuture) {
        self.spawned.borrow_mut().push(fut);
    }

    fn promote_spawned(&self) {
        let mut spawned = self.spawned.borrow_mut();
        if spawned.is_empty() {
            return;
        }
        let mut active = self.active.borrow_mut();
        for fut in spawned.drain(..) {
            active.push(fut);
        }
    }

    fn is_empty(&self) -> bool {
        self.spawned.borrow().is_empty() && self.active.borrow().is_empty()
    }

    /// Drives every active (and newly-spawned) task until none remain ready
    /// to make progress, promoting `spawned` into `active` before each poll.
    pub(crate) fn poll_all(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            self.promote_spawned();
            if self.is_empty() {
                return Poll::Ready(());
            }
            let mut active = self.active.borrow_mut();
            match Pin::new(&mut *active).poll_next(cx) {
                Poll::Ready(Some(())) => continue,
                Poll::Ready(None) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) ready: VecDeque<CompKey>,
    ready_set: rustc_hash::FxHashSet<CompKey>,
    pub(crate) in_flight: usize,
    task_counter: u64,
    pub(crate) clean_waiters: FxHashMap<VarKey, Vec<oneshot::Sender<CellResult>>>,
    pub(crate) idle_waiters: Vec<oneshot::Sender<()>>,
    dispatch_pending: bool,
}

impl SchedulerState {
    fn next_task_id(&mut self) -> u64 {
        let id = self.task_counter;
        self.task_counter += 1;
        id
    }

    fn enqueue(&mut self, key: CompKey) {
        if self.ready_set.insert(key) {
            self.ready.push_back(key);
        }
    }

    fn pop_ready(&mut self) -> Option<CompKey> {
        while let Some(key) = self.ready.pop_front() {
            self.ready_set.remove(&key);
            return Some(key);
        }
        None
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight == 0 && !self.dispatch_pending
    }
}

/// Applies the reaction a [`Transition`] describes. Abort clears the
/// running task and re-checks for a fresh schedule opportunity, since
/// clearing `running_task` alone can open a Ready state that the field
/// mutation itself didn't newly enter (§4.4, final paragraph).
pub(crate) fn apply_transition(inner: &mut Inner, comp_key: CompKey, transition: Transition) {
    match transition {
        Transition::NoOp => {}
        Transition::Schedule => {
            debug!("scheduling computation {:?}", comp_key);
            inner.scheduler.enqueue(comp_key);
            schedule_dispatch(inner);
        }
        Transition::Abort => {
            let comp = inner.store.comp_mut(comp_key);
            if let Some(task) = comp.running_task.take() {
                debug!("aborting task {} on computation {:?}", task.id, comp_key);
                task.cancel.cancel();
                comp.aborting_tasks.insert(task.id);
            }
            // Under `Immediate`, re-evaluate right away: the (state,
            // running_task) pair may have just opened a fresh
            // Ready-with-no-task opportunity. Under `Deferred` (default),
            // the replacement only gets enqueued once the cancelled task's
            // future actually settles and reaches `comp_finally` (§4.5
            // "Abort strategies") — restarting immediately would run two
            // bodies concurrently against inputs the first is still
            // unwinding from.
            if inner.options.abort_strategy == crate::config::AbortStrategy::Immediate {
                let comp = inner.store.comp(comp_key);
                if comp.state() == crate::computation::CompState::Ready && comp.running_task.is_none() {
                    inner.scheduler.enqueue(comp_key);
                    schedule_dispatch(inner);
                }
            }
        }
    }
}

/// Marks that a dispatch pass is owed on the next scheduling tick. Actual
/// draining is deferred (never run re-entrantly from inside a propagation
/// cascade) per §4.5's "Ready-queue draining is deferred to the next
/// scheduling tick".
fn schedule_dispatch(inner: &mut Inner) {
    inner.scheduler.dispatch_pending = true;
}

/// Drains as much of the ready queue as `max_concurrent` allows. Called at
/// the end of every public facade operation and from task-completion
/// continuations.
pub(crate) fn drain_ready_queue(kernel_rc: &KernelHandle) {
    loop {
        let next = {
            let mut inner = kernel_rc.borrow_mut();
            inner.scheduler.dispatch_pending = false;
            if inner.scheduler.in_flight >= inner.options.max_concurrent {
                None
            } else {
                inner.scheduler.pop_ready()
            }
        };
        let Some(comp_key) = next else { break };
        let still_ready = {
            let inner = kernel_rc.borrow();
            let comp = inner.store.try_comp(comp_key);
            comp.map(|c| c.state() == crate::computation::CompState::Ready && c.running_task.is_none())
                .unwrap_or(false)
        };
        if !still_ready {
            continue;
        }
        spawn_execution(kernel_rc, comp_key);
    }
    let idle = kernel_rc.borrow().scheduler.is_idle();
    if idle {
        let waiters = std::mem::take(&mut kernel_rc.borrow_mut().scheduler.idle_waiters);
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

fn spawn_execution(kernel_rc: &KernelHandle, comp_key: CompKey) {
    let kernel_rc = kernel_rc.clone();
    {
        let mut inner = kernel_rc.borrow_mut();
        inner.scheduler.in_flight += 1;
    }
    // The crate provides no bundled executor (the host drives the futures
    // it hands to body closures); `spawn_local`-style detachment is left to
    // the host's runtime by construction: `execute_computation` returns a
    // future the host is expected to poll via its own task spawner attached
    // through `Kernel::drive`. Here we eagerly construct that future and
    // hand it to the task pool so `Kernel::run_until_idle` can poll it (and
    // anything it in turn spawns) to completion without a separate external
    // executor.
    let tasks = Rc::clone(&kernel_rc.tasks);
    let fut = execute_computation(kernel_rc, comp_key);
    tasks.spawn(Box::pin(fut));
}

/// Runs one computation body end to end (§4.5 "Execution of one
/// computation").
async fn execute_computation(kernel_rc: KernelHandle, comp_key: CompKey) {
    // 1. Guard.
    {
        let inner = kernel_rc.borrow();
        let Some(comp) = inner.store.try_comp(comp_key) else {
            return;
        };
        if comp.state() != crate::computation::CompState::Ready || comp.observe_count == 0 {
            drop(inner);
            kernel_rc.borrow_mut().scheduler.in_flight -= 1;
            return;
        }
    }

    // 2. Input pruning.
    let current_max = {
        let inner = kernel_rc.borrow();
        let comp = inner.store.comp(comp_key);
        comp.runtime_inputs
            .iter()
            .map(|k| inner.store.var(*k).value_at)
            .max()
            .unwrap_or(LogicalClock::START)
    };
    {
        let mut inner = kernel_rc.borrow_mut();
        let comp = inner.store.comp(comp_key);
        if let Some(prev) = comp.input_version {
            if prev > LogicalClock::START && current_max <= prev {
                let outputs: Vec<VarKey> = comp.outputs.iter().flatten().copied().collect();
                for out in outputs {
                    inner.store.var_mut(out).dirty = false;
                }
                let comp = inner.store.comp_mut(comp_key);
                let transition = comp.set_dirty(false);
                drop(transition);
                inner.scheduler.in_flight -= 1;
                return;
            }
        }
    }

    // 3. Task setup.
    let (scope, cancel, task_id, body, output_ids, comp_id, touched) = {
        let mut inner = kernel_rc.borrow_mut();
        let task_id = inner.scheduler.next_task_id();
        let cancel = CancelToken::new();
        let comp = inner.store.comp_mut(comp_key);
        let cause_at = comp.cause_at;
        comp.running_task = Some(TaskHandle { id: task_id, cause_at, cancel: cancel.clone() });
        let body = comp.def.body.clone();
        let output_ids = comp.def.output_ids.clone();
        let comp_id = comp.def.id.clone();
        let touched = Rc::new(RefCell::new(rustc_hash::FxHashSet::default()));
        let scope = Scope::new(kernel_rc.clone(), comp_key, cancel.clone(), Rc::clone(&touched));
        (scope, cancel, task_id, body, output_ids, comp_id, touched)
    };
    debug!("executing computation {} (task {})", comp_id, task_id);

    // 5. Invoke.
    let outcome = body(scope, cancel.child()).await;
    if cancel.is_cancelled() {
        finish_aborted(&kernel_rc, comp_key, task_id);
        return;
    }

    let touched = Rc::try_unwrap(touched).map(RefCell::into_inner).unwrap_or_default();
    match outcome {
        Ok(outputs) => finish_success(&kernel_rc, comp_key, task_id, &output_ids, outputs, current_max, &touched),
        Err(err) => finish_error(&kernel_rc, comp_key, task_id, &output_ids, err, current_max),
    }
}

fn finish_success(
    kernel_rc: &KernelHandle,
    comp_key: CompKey,
    task_id: u64,
    output_ids: &[crate::ids::VariableId],
    mut outputs: crate::computation::BodyOutputs,
    current_max: LogicalClock,
    touched: &rustc_hash::FxHashSet<VarKey>,
) {
    let mut inner = kernel_rc.borrow_mut();
    let out_keys: Vec<VarKey> = inner.store.comp(comp_key).outputs.iter().flatten().copied().collect();

    let mut any_changed = false;
    let mut new_values = Vec::new();
    for (out_key, out_id) in out_keys.iter().zip(output_ids.iter()) {
        let new_value = outputs.remove(out_id.as_str());
        let changed = match (&inner.store.var(*out_key).result, &new_value) {
            (CellResult::Success(old), Some(new)) => !values_equal(old, new),
            (_, Some(_)) => true,
            (_, None) => false,
        };
        any_changed |= changed;
        new_values.push((*out_key, new_value, changed));
    }

    let tick = if any_changed { Some(inner.clock.tick()) } else { None };
    let comp_cause = inner.store.comp(comp_key).cause_at;

    for (out_key, new_value, changed) in new_values {
        if let Some(value) = new_value {
            if changed {
                inner.store.var_mut(out_key).value_at = tick.unwrap();
                inner.store.var_mut(out_key).result = CellResult::Success(value);
            }
        }
        inner.store.var_mut(out_key).cause_at = comp_cause;
        inner.store.var_mut(out_key).dirty = false;
        crate::propagation::clean_variable(&mut inner, out_key);
        notify_clean_waiters(&mut inner, out_key);
    }

    cleanup_unused_inputs(&mut inner, comp_key, touched);

    let comp = inner.store.comp_mut(comp_key);
    let transition = comp.set_dirty(false);
    apply_transition(&mut inner, comp_key, transition);
    comp_finally(&mut inner, comp_key, task_id, current_max);
    drop(inner);
    drain_ready_queue(kernel_rc);
}

fn finish_error(
    kernel_rc: &KernelHandle,
    comp_key: CompKey,
    task_id: u64,
    _output_ids: &[crate::ids::VariableId],
    err: Rc<dyn std::error::Error>,
    current_max: LogicalClock,
) {
    let mut inner = kernel_rc.borrow_mut();
    let out_keys: Vec<VarKey> = inner.store.comp(comp_key).outputs.iter().flatten().copied().collect();
    let tick = inner.clock.tick();
    for out_key in out_keys {
        inner.store.var_mut(out_key).result = CellResult::Error(Rc::clone(&err));
        inner.store.var_mut(out_key).value_at = tick;
        inner.store.var_mut(out_key).dirty = false;
        crate::propagation::clean_variable(&mut inner, out_key);
        notify_clean_waiters(&mut inner, out_key);
    }
    let comp = inner.store.comp_mut(comp_key);
    let transition = comp.set_dirty(false);
    apply_transition(&mut inner, comp_key, transition);
    comp_finally(&mut inner, comp_key, task_id, current_max);
    drop(inner);
    drain_ready_queue(kernel_rc);
}

fn finish_aborted(kernel_rc: &KernelHandle, comp_key: CompKey, task_id: u64) {
    let mut inner = kernel_rc.borrow_mut();
    // dirty stays true: the computation is rescheduled.
    comp_finally(&mut inner, comp_key, task_id, LogicalClock::START);
    drop(inner);
    drain_ready_queue(kernel_rc);
}

fn comp_finally(inner: &mut Inner, comp_key: CompKey, task_id: u64, current_max: LogicalClock) {
    inner.scheduler.in_flight -= 1;
    if inner.store.try_comp(comp_key).is_none() {
        return;
    }
    let was_running = inner.store.comp(comp_key).running_task.as_ref().map(|t| t.id) == Some(task_id);
    if was_running {
        inner.store.comp_mut(comp_key).running_task = None;
    } else {
        inner.store.comp_mut(comp_key).aborting_tasks.remove(&task_id);
        // A deferred-strategy successor couldn't be enqueued at abort time;
        // now that the cancelled task has actually settled, take the
        // opportunity if the computation is still Ready.
        let comp = inner.store.comp(comp_key);
        if comp.state() == crate::computation::CompState::Ready && comp.running_task.is_none() {
            inner.scheduler.enqueue(comp_key);
            schedule_dispatch(inner);
        }
    }
    if current_max > LogicalClock::START {
        inner.store.comp_mut(comp_key).input_version = Some(current_max);
    }

    let still_dirty = inner.store.comp(comp_key).dirty;
    if !still_dirty {
        return;
    }
    let runtime_inputs: Vec<VarKey> = inner.store.comp(comp_key).runtime_inputs.iter().copied().collect();
    let comp_cause = inner.store.comp(comp_key).cause_at;
    let max_cause = runtime_inputs
        .iter()
        .map(|k| inner.store.var(*k).cause_at)
        .max()
        .unwrap_or(comp_cause);
    if max_cause > comp_cause {
        if let Some(source) = runtime_inputs.first().copied() {
            crate::propagation::propagate_cause_downward(inner, comp_key, max_cause, source, false);
        }
    }
}

/// §4.5 step 6: "clean up unused runtime inputs (those not accessed this
/// execution)". A successful run's `touched` set is the ground truth for
/// what the body actually read this time; anything left in
/// `runtime_inputs` that wasn't touched is detached — its observe-count
/// contribution withdrawn, its dirty-input accounting corrected, and the
/// dependency edge removed so a later unrelated update to it no longer
/// dirties this computation.
fn cleanup_unused_inputs(inner: &mut Inner, comp_key: CompKey, touched: &rustc_hash::FxHashSet<VarKey>) {
    let stale: Vec<VarKey> = inner
        .store
        .comp(comp_key)
        .runtime_inputs
        .iter()
        .copied()
        .filter(|k| !touched.contains(k))
        .collect();
    if stale.is_empty() {
        return;
    }
    let comp_observe_count = inner.store.comp(comp_key).observe_count;
    for input in stale {
        let was_dirty = inner.store.var(input).dirty && inner.store.var(input).producer.is_some();
        inner.store.var_mut(input).dependents.remove(&comp_key);
        inner.store.comp_mut(comp_key).runtime_inputs.remove(&input);
        if comp_observe_count > 0 {
            crate::propagation::propagate_observe_count(inner, input, -(comp_observe_count as i64));
        }
        if was_dirty {
            let comp = inner.store.comp_mut(comp_key);
            let new_count = comp.dirty_input_count.saturating_sub(1);
            let transition = comp.set_dirty_input_count(new_count);
            apply_transition(inner, comp_key, transition);
        }
    }
}

fn notify_clean_waiters(inner: &mut Inner, var: VarKey) {
    if let Some(waiters) = inner.scheduler.clean_waiters.remove(&var) {
        let result = inner.store.var(var).result.clone();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Pull-mode evaluation (§4.5, "Pull evaluation"): resolves once `v` is
/// clean, observing it in the meantime so visibility-driven scheduling
/// fires upward.
pub(crate) async fn evaluate(
    kernel_rc: KernelHandle,
    var: VarKey,
    cancel: CancelToken,
) -> Result<CellResult, Aborted> {
    let (needs_wait, is_source) = {
        let inner = kernel_rc.borrow();
        let v = inner.store.var(var);
        (v.dirty, v.producer.is_none())
    };
    if !needs_wait || is_source {
        return Ok(kernel_rc.borrow().store.var(var).result.clone());
    }

    let rx = {
        let mut inner = kernel_rc.borrow_mut();
        crate::propagation::propagate_observe_count(&mut inner, var, 1);
        let (tx, rx) = oneshot::channel();
        inner.scheduler.clean_waiters.entry(var).or_default().push(tx);
        rx
    };
    drain_ready_queue(&kernel_rc);

    use futures_util::future::{select, Either};
    let outcome = select(rx, cancel.cancelled()).await;
    crate::propagation::propagate_observe_count(&mut kernel_rc.borrow_mut(), var, -1);
    match outcome {
        Either::Left((Ok(result), _)) => Ok(result),
        Either::Left((Err(_), _)) => {
            warn!("clean-waiter channel dropped for {:?}", var);
            Ok(kernel_rc.borrow().store.var(var).result.clone())
        }
        Either::Right(((), _)) => Err(Aborted),
    }
}
