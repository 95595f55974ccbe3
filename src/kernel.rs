//! Public facade (§4.7) and the `Inner` state it serializes access to.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures_channel::oneshot;
use indexmap::IndexSet;
use log::{debug, info};

use crate::clock::Clock;
use crate::computation::{BodyFn, CompStatus};
use crate::config::ReactiveModuleOptions;
use crate::error::{KernelError, KernelResult};
use crate::graph::GraphStore;
use crate::ids::{CompKey, ComputationId, VarKey, VariableId};
use crate::observer::{ObserverCallback, ObserverToken};
use crate::result::{CellResult, ProblemReason, StructuralError};
use crate::scheduler::{self, SchedulerState, TaskPool};
use crate::task::{Aborted, CancelToken};
use crate::value::DynValue;
use crate::variable::Variable;

pub(crate) struct Inner {
    pub(crate) store: GraphStore,
    pub(crate) clock: Clock,
    pub(crate) options: ReactiveModuleOptions,
    pub(crate) scheduler: SchedulerState,
    /// Tokens returned by `observe`, mapped back to (variable, per-variable
    /// token) so `unsubscribe` can find the right slot.
    pub(crate) observer_index: rustc_hash::FxHashMap<u64, (VarKey, ObserverToken)>,
    next_handle: u64,
}

/// A clonable, two-part handle to the kernel: the graph state (`inner`,
/// borrowed synchronously for every mutation) and the spawned-task pool
/// (`tasks`, polled by `Kernel::run_until_idle`). Kept as separate `Rc`s
/// rather than one so that driving `tasks` to completion never needs to
/// hold `inner` borrowed across a suspension point — see `TaskPool`'s doc
/// comment in `scheduler.rs` for why that split is load-bearing, not
/// cosmetic.
#[derive(Clone)]
pub(crate) struct KernelHandle {
    pub(crate) inner: Rc<RefCell<Inner>>,
    pub(crate) tasks: Rc<TaskPool>,
}

impl std::ops::Deref for KernelHandle {
    type Target = Rc<RefCell<Inner>>;
    fn deref(&self) -> &Rc<RefCell<Inner>> {
        &self.inner
    }
}

/// Detaches every observer registered on the given output cells, keyed by
/// output name rather than `VarKey` so it survives the cell being torn down
/// and rebuilt under the same name — shared by [`Kernel::redefine_computation`]
/// and [`crate::problem::try_recover`], both of which replace a computation's
/// output cells in place and must carry the host's subscriptions across the
/// swap rather than silently dropping them (§4.6 "Redefinition"; §4.6
/// "Repair on each structural event" applies the same contract to automatic
/// recovery).
pub(crate) fn save_observers_by_output(
    inner: &mut Inner,
    output_keys: &[Option<VarKey>],
) -> Vec<(VariableId, Vec<(u64, ObserverCallback)>)> {
    let mut saved = Vec::new();
    for out_key in output_keys.iter().flatten().copied() {
        let Some(out_id) = inner.store.var_id(out_key).cloned() else { continue };
        let handles: Vec<u64> = inner
            .observer_index
            .iter()
            .filter(|(_, (k, _))| *k == out_key)
            .map(|(h, _)| *h)
            .collect();
        let mut callbacks = Vec::new();
        for handle_id in handles {
            if let Some((_, token)) = inner.observer_index.remove(&handle_id) {
                if let Some(cb) = inner.store.var_mut(out_key).observers.take(token) {
                    callbacks.push((handle_id, cb));
                }
            }
        }
        saved.push((out_id, callbacks));
    }
    saved
}

/// Reattaches observers saved by [`save_observers_by_output`] onto whatever
/// cell now lives under the same output name, re-notifying each with the
/// new cell's current result and restoring the observe-count it contributed
/// so scheduling stays consistent with who's actually watching.
pub(crate) fn restore_observers_by_output(inner: &mut Inner, saved: Vec<(VariableId, Vec<(u64, ObserverCallback)>)>) {
    for (out_id, callbacks) in saved {
        if callbacks.is_empty() {
            continue;
        }
        let Some(new_key) = inner.store.var_key(&out_id) else { continue };
        let result = inner.store.var(new_key).result.clone();
        for (handle_id, cb) in callbacks {
            cb(&result);
            let token = inner.store.var_mut(new_key).observers.insert(cb);
            inner.observer_index.insert(handle_id, (new_key, token));
        }
        let count = inner.store.var(new_key).observers.len();
        crate::propagation::propagate_observe_count(inner, new_key, count as i64);
    }
}

/// The reactive kernel. Cheap to clone (two `Rc` handles); clones share one
/// underlying graph. Not `Send`/`Sync` — the scheduling model is explicitly
/// single-threaded (§5); hosts post operations onto one thread themselves.
#[derive(Clone)]
pub struct Kernel(KernelHandle);

/// Status returned from `defineSource`/`defineComputation` (§6).
#[derive(Debug, Clone)]
pub enum DefinitionStatus {
    Healthy,
    Problematic(Vec<StructuralError>),
}

/// Status returned from `removeSource`/`removeComputation` (§6). Removal
/// never fails; this just reports whether there was anything to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalStatus {
    Removed,
    NotFound,
}

/// Snapshot returned by `peek`/`peekComputation` (§6).
#[derive(Debug, Clone)]
pub struct VariableSnapshot {
    pub result: CellResult,
    pub is_dirty: bool,
}

#[derive(Debug, Clone)]
pub struct ComputationSnapshot {
    pub state: crate::computation::CompState,
    pub dirty: bool,
    pub observe_count: u32,
    pub dirty_input_count: u32,
    pub is_problem: bool,
}

#[derive(Debug, Clone)]
pub struct ProblemComputationInfo {
    pub id: ComputationId,
    pub reason: ProblemReason,
    pub missing_inputs: Vec<VariableId>,
    pub conflicts_with: Option<ComputationId>,
}

#[derive(Debug, Clone)]
pub struct ProblemVariableInfo {
    pub id: VariableId,
    pub reason: ProblemReason,
}

/// Aggregate counts for host dashboards (§10.5), grounded in the teacher's
/// `Event`/`EventKind` observability hook: a cheap read-only snapshot the
/// crate exposes without picking a destination for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphHealth {
    pub healthy_variables: usize,
    pub healthy_computations: usize,
    pub problem_variables: usize,
    pub problem_computations: usize,
    pub in_flight_tasks: usize,
    pub ready_queue_depth: usize,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(ReactiveModuleOptions::default())
    }
}

impl Kernel {
    pub fn new(options: ReactiveModuleOptions) -> Self {
        Kernel(KernelHandle {
            inner: Rc::new(RefCell::new(Inner {
                store: GraphStore::default(),
                clock: Clock::default(),
                options,
                scheduler: SchedulerState::default(),
                observer_index: rustc_hash::FxHashMap::default(),
                next_handle: 0,
            })),
            tasks: Rc::new(TaskPool::default()),
        })
    }

    /// Drives all currently in-flight computation bodies (and anything
    /// they transitively schedule) to quiescence. There is no bundled
    /// executor thread — the host polls this the way it polls any other
    /// future — matching §5's model where the host "is responsible for
    /// posting operations onto the scheduler thread".
    ///
    /// Polls the kernel's single `TaskPool` directly rather than swapping it
    /// out for a snapshot batch: a body awaited from inside this poll (e.g.
    /// `scope.get` on a dynamic dependency) can spawn its own producer's
    /// execution mid-drain, and that producer must be driven in the *same*
    /// pass or the consumer waiting on it would never see progress.
    pub async fn run_until_idle(&self) {
        let tasks = Rc::clone(&self.0.tasks);
        std::future::poll_fn(move |cx| tasks.poll_all(cx)).await
    }

    pub fn define_source(&self, id: impl Into<VariableId>, initial_value: Option<DynValue>) -> DefinitionStatus {
        let id = id.into();
        let mut inner = self.0.borrow_mut();
        let mut var = Variable::new_source();
        if let Some(value) = initial_value {
            let tick = inner.clock.tick();
            var.value_at = tick;
            var.cause_at = tick;
            var.result = CellResult::Success(value);
        }
        inner.store.insert_variable(id.clone(), var);
        crate::problem::repair_for_new_variable(&mut inner, id.clone());
        crate::problem::recheck_cycles(&mut inner);
        info!("source `{}` defined", id);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        DefinitionStatus::Healthy
    }

    /// As [`Kernel::define_source`], but if `id` already names a live
    /// source, overwrites its value in place instead of shadowing it with a
    /// second, disconnected cell. Per §9 Open Question (c), an unchanged
    /// value still advances `cause_at` (a perturbation was observed, even a
    /// no-op one) without advancing `value_at` (nothing a dependent would
    /// need to recompute over actually changed). If `id` names a
    /// computation's output instead of a source, this is a no-op: a
    /// computed cell's identity isn't something `defineSource` can claim.
    pub fn redefine_source(&self, id: impl Into<VariableId>, initial_value: Option<DynValue>) -> DefinitionStatus {
        let id = id.into();
        let mut inner = self.0.borrow_mut();
        let Some(key) = inner.store.var_key(&id) else {
            drop(inner);
            return self.define_source(id, initial_value);
        };
        if !inner.store.var(key).is_source() {
            return DefinitionStatus::Healthy;
        }

        let changed = match (&inner.store.var(key).result, &initial_value) {
            (CellResult::Success(old), Some(new)) => !crate::value::values_equal(old, new),
            (_, Some(_)) => true,
            (_, None) => false,
        };
        let tick = inner.clock.tick();
        {
            let var = inner.store.var_mut(key);
            if let Some(value) = initial_value {
                if changed {
                    var.value_at = tick;
                }
                var.result = CellResult::Success(value);
            }
            var.cause_at = tick;
        }
        let dependents: Vec<CompKey> = inner.store.var(key).dependents.iter().copied().collect();
        for dep in dependents {
            crate::propagation::propagate_cause_downward(&mut inner, dep, tick, key, changed);
        }
        info!("source `{}` redefined", id);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        DefinitionStatus::Healthy
    }

    #[allow(clippy::too_many_arguments)]
    pub fn define_computation(
        &self,
        id: impl Into<ComputationId>,
        inputs: impl IntoIterator<Item = VariableId>,
        outputs: impl IntoIterator<Item = VariableId>,
        body: BodyFn,
    ) -> DefinitionStatus {
        let id = id.into();
        let static_inputs: IndexSet<VariableId> = inputs.into_iter().collect();
        let output_ids: Vec<VariableId> = outputs.into_iter().collect();
        let mut inner = self.0.borrow_mut();
        let outcome = crate::problem::define_computation(&mut inner, id, static_inputs, output_ids, body, false);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        if outcome.problems.is_empty() {
            DefinitionStatus::Healthy
        } else {
            DefinitionStatus::Problematic(outcome.problems)
        }
    }

    pub fn update_source(&self, id: &VariableId, value: DynValue) -> KernelResult<()> {
        let mut inner = self.0.borrow_mut();
        let Some(key) = inner.store.var_key(id) else {
            return Err(KernelError::UnknownId(id.as_str().to_string()));
        };
        if !inner.store.var(key).is_source() {
            return Err(KernelError::NotASource(id.clone()));
        }
        let changed = match &inner.store.var(key).result {
            CellResult::Success(old) => !crate::value::values_equal(old, &value),
            _ => true,
        };
        let tick = inner.clock.tick();
        {
            let var = inner.store.var_mut(key);
            if changed {
                var.value_at = tick;
            }
            var.cause_at = tick;
            var.result = CellResult::Success(value);
        }
        let dependents: Vec<CompKey> = inner.store.var(key).dependents.iter().copied().collect();
        for dep in dependents {
            crate::propagation::propagate_cause_downward(&mut inner, dep, tick, key, true);
        }
        debug!("source `{}` updated (changed={})", id, changed);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        Ok(())
    }

    pub fn remove_source(&self, id: &VariableId) -> RemovalStatus {
        let mut inner = self.0.borrow_mut();
        let Some(key) = inner.store.var_key(id) else {
            return RemovalStatus::NotFound;
        };
        if !inner.store.var(key).is_source() {
            return RemovalStatus::NotFound;
        }
        let dependents: Vec<CompKey> = inner.store.var(key).dependents.iter().copied().collect();
        inner.store.remove_variable(key);
        crate::problem::on_removed_variable(&mut inner, id.clone(), dependents);
        info!("source `{}` removed", id);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        RemovalStatus::Removed
    }

    pub fn remove_computation(&self, id: &ComputationId) -> RemovalStatus {
        let mut inner = self.0.borrow_mut();
        let Some(key) = inner.store.comp_key(id) else {
            return RemovalStatus::NotFound;
        };
        Self::remove_computation_locked(&mut inner, key);
        info!("computation `{}` removed", id);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        RemovalStatus::Removed
    }

    /// The guts of `remove_computation`, factored out so `redefine_computation`
    /// can reuse it on an already-borrowed `Inner` (§4.6 "Redefinition": a
    /// full replace is defined as "remove the old node... define anew").
    fn remove_computation_locked(inner: &mut Inner, key: CompKey) {
        if let Some(task) = inner.store.comp(key).running_task.as_ref() {
            task.cancel.cancel();
        }
        let output_keys: Vec<VarKey> = inner.store.comp(key).outputs.iter().flatten().copied().collect();
        let runtime_inputs: Vec<VarKey> = inner.store.comp(key).runtime_inputs.iter().copied().collect();
        for input in &runtime_inputs {
            inner.store.var_mut(*input).dependents.remove(&key);
        }
        // Save observers by output name before tearing the cells down: if
        // removing this computation frees a first-win output for a waiter
        // (or otherwise triggers a same-named replacement further down),
        // whoever was watching the old cell should keep watching rather
        // than go silent (§4.6, same contract as `redefine_computation`).
        let saved_output_keys: Vec<Option<VarKey>> = output_keys.iter().copied().map(Some).collect();
        let saved_observers = save_observers_by_output(inner, &saved_output_keys);
        let mut removed_ids = Vec::new();
        let mut all_dependents = Vec::new();
        for out_key in &output_keys {
            let out_id = inner.store.var_id(*out_key).cloned().unwrap();
            all_dependents.extend(inner.store.var(*out_key).dependents.iter().copied());
            inner.store.producer_by_output.remove(&out_id);
            inner.store.remove_variable(*out_key);
            removed_ids.push(out_id);
        }
        inner.store.remove_computation(key);
        for out_id in removed_ids {
            crate::problem::on_removed_variable(inner, out_id, all_dependents.clone());
        }
        restore_observers_by_output(inner, saved_observers);
    }

    /// As [`Kernel::define_computation`], but when `id` already names a
    /// computation, replaces it in place instead of quarantining the new
    /// shape as a duplicate output (§4.6 "Redefinition"). Observers on
    /// outputs that survive the replacement are carried over and
    /// re-notified with the new cell's result, even when that result is
    /// `Uninitialized` — so the client sees state roll back and forward
    /// coherently rather than going silent across the swap.
    pub fn redefine_computation(
        &self,
        id: impl Into<ComputationId>,
        inputs: impl IntoIterator<Item = VariableId>,
        outputs: impl IntoIterator<Item = VariableId>,
        body: BodyFn,
    ) -> DefinitionStatus {
        let id = id.into();
        let static_inputs: IndexSet<VariableId> = inputs.into_iter().collect();
        let output_ids: Vec<VariableId> = outputs.into_iter().collect();
        let mut inner = self.0.borrow_mut();

        let Some(existing_key) = inner.store.comp_key(&id) else {
            let outcome = crate::problem::define_computation(&mut inner, id, static_inputs, output_ids, body, false);
            drop(inner);
            scheduler::drain_ready_queue(&self.0);
            self.check_invariants();
            return if outcome.problems.is_empty() {
                DefinitionStatus::Healthy
            } else {
                DefinitionStatus::Problematic(outcome.problems)
            };
        };

        // 1. Save observer callbacks (and their handle ids, so a caller's
        // `Unsubscribe` from before the swap keeps resolving) per existing
        // output name.
        let old_outputs: Vec<Option<VarKey>> = inner.store.comp(existing_key).outputs.clone();
        let saved = save_observers_by_output(&mut inner, &old_outputs);

        // 2. Remove the old node (recursively marks downstream as problem
        // if an output this new shape doesn't reproduce disappears).
        Self::remove_computation_locked(&mut inner, existing_key);

        // 3. Define anew.
        let outcome = crate::problem::define_computation(&mut inner, id.clone(), static_inputs, output_ids.clone(), body, false);

        // 4. Restore observers onto surviving output names and re-notify.
        restore_observers_by_output(&mut inner, saved);

        info!("computation `{}` redefined", id);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        if outcome.problems.is_empty() {
            DefinitionStatus::Healthy
        } else {
            DefinitionStatus::Problematic(outcome.problems)
        }
    }

    /// Subscribes to a cell. Per §6, a currently-clean (or problematic —
    /// `Fatal` counts as clean) variable notifies immediately, before this
    /// call returns its unsubscribe handle.
    pub fn observe(&self, id: &VariableId, callback: ObserverCallback) -> KernelResult<Unsubscribe> {
        let mut inner = self.0.borrow_mut();
        let Some(key) = inner.store.var_key(id) else {
            return Err(KernelError::UnknownId(id.as_str().to_string()));
        };
        let not_dirty = !inner.store.var(key).dirty;
        if not_dirty {
            let result = inner.store.var(key).result.clone();
            callback(&result);
        }
        let token = inner.store.var_mut(key).observers.insert(callback);
        let handle_id = inner.next_handle;
        inner.next_handle += 1;
        inner.observer_index.insert(handle_id, (key, token));
        crate::propagation::propagate_observe_count(&mut inner, key, 1);
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
        Ok(Unsubscribe { kernel: self.0.clone(), handle_id })
    }

    pub async fn get_value_result(&self, id: &VariableId) -> KernelResult<CellResult> {
        let key = {
            let inner = self.0.borrow();
            inner.store.var_key(id).ok_or_else(|| KernelError::UnknownId(id.as_str().to_string()))?
        };
        let cancel = CancelToken::new();
        loop {
            match scheduler::evaluate(self.0.clone(), key, cancel.clone()).await {
                Ok(result) => return Ok(result),
                Err(Aborted) => continue,
            }
        }
    }

    pub async fn get_value(&self, id: &VariableId) -> KernelResult<DynValue> {
        let result = self.get_value_result(id).await?;
        match result {
            CellResult::Success(v) => Ok(v),
            CellResult::Error(e) => Err(KernelError::InvariantViolation(format!("body error: {e}"))),
            CellResult::Fatal(e) => Err(KernelError::InvariantViolation(format!("fatal: {e}"))),
            CellResult::Uninitialized => Err(KernelError::InvariantViolation(format!("`{id}` is uninitialized"))),
        }
    }

    pub fn peek(&self, id: &VariableId) -> KernelResult<VariableSnapshot> {
        let inner = self.0.borrow();
        let key = inner.store.var_key(id).ok_or_else(|| KernelError::UnknownId(id.as_str().to_string()))?;
        let var = inner.store.var(key);
        Ok(VariableSnapshot { result: var.result.clone(), is_dirty: var.dirty })
    }

    pub fn peek_computation(&self, id: &ComputationId) -> KernelResult<ComputationSnapshot> {
        let inner = self.0.borrow();
        let key = inner.store.comp_key(id).ok_or_else(|| KernelError::UnknownId(id.as_str().to_string()))?;
        let comp = inner.store.comp(key);
        Ok(ComputationSnapshot {
            state: comp.state(),
            dirty: comp.dirty,
            observe_count: comp.observe_count,
            dirty_input_count: comp.dirty_input_count,
            is_problem: comp.is_problem(),
        })
    }

    pub async fn wait_idle(&self) {
        let rx = {
            let mut inner = self.0.borrow_mut();
            if inner.scheduler.is_idle() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.scheduler.idle_waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            self.run_until_idle().await;
            let _ = rx.await;
        }
    }

    /// §9 Open Question (a): the source's `withTransaction` is a literal
    /// no-op wrapper, not a batching primitive. A true batched-clock-tick
    /// semantics was explicitly flagged as unspecified ("do not guess") —
    /// this stays a pass-through, as the spec's own body text describes.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(Kernel) -> Fut,
        Fut: Future<Output = T>,
    {
        f(self.clone()).await
    }

    pub fn get_problem_computations(&self) -> Vec<ProblemComputationInfo> {
        let inner = self.0.borrow();
        inner
            .store
            .all_comp_keys()
            .filter_map(|key| {
                let comp = inner.store.comp(key);
                let CompStatus::Problem(state) = &comp.status else { return None };
                Some(ProblemComputationInfo {
                    id: comp.def.id.clone(),
                    reason: state.error.reason,
                    missing_inputs: state.missing_inputs.iter().cloned().collect(),
                    conflicts_with: state.conflicts_with.clone(),
                })
            })
            .collect()
    }

    pub fn get_problem_variables(&self) -> Vec<ProblemVariableInfo> {
        let inner = self.0.borrow();
        inner
            .store
            .all_var_keys()
            .filter_map(|key| {
                let var = inner.store.var(key);
                let CellResult::Fatal(err) = &var.result else { return None };
                Some(ProblemVariableInfo { id: inner.store.var_id(key).cloned()?, reason: err.reason })
            })
            .collect()
    }

    pub fn trace_problem_root(&self, id: &ComputationId) -> Vec<String> {
        let inner = self.0.borrow();
        crate::problem::trace_root(&inner, id)
    }

    pub fn get_graph_health(&self) -> GraphHealth {
        let inner = self.0.borrow();
        let mut health = GraphHealth::default();
        for key in inner.store.all_var_keys() {
            if matches!(inner.store.var(key).result, CellResult::Fatal(_)) {
                health.problem_variables += 1;
            } else {
                health.healthy_variables += 1;
            }
        }
        for key in inner.store.all_comp_keys() {
            if inner.store.comp(key).is_problem() {
                health.problem_computations += 1;
            } else {
                health.healthy_computations += 1;
            }
        }
        health.in_flight_tasks = inner.scheduler.in_flight;
        health.ready_queue_depth = inner.scheduler.ready.len();
        health
    }

    fn unsubscribe(&self, handle_id: u64) {
        let mut inner = self.0.borrow_mut();
        if let Some((var_key, token)) = inner.observer_index.remove(&handle_id) {
            if inner.store.try_var(var_key).is_some() {
                inner.store.var_mut(var_key).observers.remove(token);
                crate::propagation::propagate_observe_count(&mut inner, var_key, -1);
            }
        }
        drop(inner);
        scheduler::drain_ready_queue(&self.0);
        self.check_invariants();
    }

    /// Walks the §8 quantified invariants when `assertInvariants` is on
    /// (§6, §10.2); a no-op otherwise. Called at the end of every mutating
    /// facade operation and every execution-completion path.
    fn check_invariants(&self) {
        crate::invariants::check(&self.0.borrow());
    }
}

/// Handle returned by `observe`; call `unsubscribe()` to stop receiving
/// notifications (§6: `observe` returns `unsubscribe()`, an explicit
/// function rather than a `Drop` guard).
pub struct Unsubscribe {
    kernel: KernelHandle,
    handle_id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        Kernel(self.kernel.clone()).unsubscribe(self.handle_id);
    }
}

/// The object handed to a computation body for dynamic input access (§4.5
/// step 4, "Scope proxy").
pub struct Scope {
    kernel: KernelHandle,
    comp_key: CompKey,
    cancel: CancelToken,
    /// Every variable this body actually touched this run, shared with the
    /// executor so it can detach whatever in `runtime_inputs` went
    /// untouched (§4.5 step 6, "Clean-up unused runtime inputs").
    pub(crate) touched: Rc<RefCell<rustc_hash::FxHashSet<VarKey>>>,
}

#[derive(Debug)]
pub enum ScopeError {
    Aborted,
    UnknownVariable(String),
    InvalidDynamicAccess(String),
    Upstream(Rc<dyn std::error::Error>),
    Fatal(StructuralError),
    Uninitialized(String),
}

impl std::fmt::Display for ScopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeError::Aborted => write!(f, "task aborted"),
            ScopeError::UnknownVariable(id) => write!(f, "unknown variable `{id}`"),
            ScopeError::InvalidDynamicAccess(id) => {
                write!(f, "`{id}` accessed dynamically without being declared as a static input")
            }
            ScopeError::Upstream(e) => write!(f, "{e}"),
            ScopeError::Fatal(e) => write!(f, "{e}"),
            ScopeError::Uninitialized(id) => write!(f, "`{id}` is uninitialized"),
        }
    }
}

impl std::error::Error for ScopeError {}

impl From<ScopeError> for Rc<dyn std::error::Error> {
    fn from(e: ScopeError) -> Self {
        Rc::new(e)
    }
}

impl Scope {
    pub(crate) fn new(
        kernel: KernelHandle,
        comp_key: CompKey,
        cancel: CancelToken,
        touched: Rc<RefCell<rustc_hash::FxHashSet<VarKey>>>,
    ) -> Self {
        Scope { kernel, comp_key, cancel, touched }
    }

    /// Resolves `name` as a dependency, awaiting it to a clean state and
    /// attaching it to the calling computation's `runtime_inputs` if it
    /// wasn't already there (§4.5 step 4).
    pub async fn get(&self, name: &str) -> Result<DynValue, ScopeError> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::Aborted);
        }
        let var_id = VariableId::new(name);
        let var_key = {
            let inner = self.kernel.borrow();
            inner.store.var_key(&var_id).ok_or_else(|| ScopeError::UnknownVariable(name.to_string()))?
        };

        let result = match scheduler::evaluate(self.kernel.clone(), var_key, self.cancel.child()).await {
            Ok(r) => r,
            Err(Aborted) => return Err(ScopeError::Aborted),
        };

        self.attach_if_new(var_key, name)?;

        match result {
            CellResult::Success(v) => Ok(v),
            CellResult::Error(e) => Err(ScopeError::Upstream(e)),
            CellResult::Fatal(e) => Err(ScopeError::Fatal(e)),
            CellResult::Uninitialized => Err(ScopeError::Uninitialized(name.to_string())),
        }
    }

    /// The reserved `__getResult` accessor: returns the full [`CellResult`]
    /// without throwing on a non-success variant. Still awaits the cell to a
    /// clean state and attaches it as a runtime input like [`Scope::get`] —
    /// it only differs in not collapsing `Error`/`Fatal`/`Uninitialized`
    /// into an `Err`.
    pub async fn get_result(&self, name: &str) -> Result<CellResult, ScopeError> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::Aborted);
        }
        let var_id = VariableId::new(name);
        let var_key = {
            let inner = self.kernel.borrow();
            inner.store.var_key(&var_id).ok_or_else(|| ScopeError::UnknownVariable(name.to_string()))?
        };

        let result = match scheduler::evaluate(self.kernel.clone(), var_key, self.cancel.child()).await {
            Ok(r) => r,
            Err(Aborted) => return Err(ScopeError::Aborted),
        };

        self.attach_if_new(var_key, name)?;

        Ok(result)
    }

    fn attach_if_new(&self, var_key: VarKey, name: &str) -> Result<(), ScopeError> {
        self.touched.borrow_mut().insert(var_key);

        let mut inner = self.kernel.borrow_mut();
        let already_attached = inner.store.comp(self.comp_key).runtime_inputs.contains(&var_key);
        if already_attached {
            return Ok(());
        }
        let declared = inner.store.comp(self.comp_key).def.static_inputs.contains(&VariableId::new(name));
        if !declared {
            return Err(ScopeError::InvalidDynamicAccess(name.to_string()));
        }

        let var_cause = inner.store.var(var_key).cause_at;
        if let Some(task) = &mut inner.store.comp_mut(self.comp_key).running_task {
            if var_cause > task.cause_at {
                task.cause_at = var_cause;
            }
        }

        inner.store.comp_mut(self.comp_key).runtime_inputs.insert(var_key);
        inner.store.var_mut(var_key).dependents.insert(self.comp_key);

        let comp_observe_count = inner.store.comp(self.comp_key).observe_count;
        crate::propagation::propagate_observe_count(&mut inner, var_key, comp_observe_count as i64);

        let new_cause = inner.store.comp(self.comp_key).cause_at;
        crate::propagation::propagate_cause_downward(&mut inner, self.comp_key, new_cause, var_key, false);

        if inner.store.var(var_key).dirty {
            let comp = inner.store.comp_mut(self.comp_key);
            let new_count = comp.dirty_input_count + 1;
            let transition = comp.set_dirty_input_count(new_count);
            scheduler::apply_transition(&mut inner, self.comp_key, transition);
        }

        Ok(())
    }
}
