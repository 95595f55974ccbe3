//! Structural problem classification, quarantine, and repair (§4.6).
//!
//! The normal/problem split is carried as a `status` field on each
//! [`Computation`] and [`Variable`] rather than as separate arenas (§9,
//! "An implementation may merge the two tables and carry a status
//! attribute... the parallel-tables approach the source uses is simply an
//! index optimization").

use log::info;
use rustc_hash::FxHashSet;

use crate::computation::{BodyFn, CompStatus, Computation, ComputationDef, ProblemState};
use crate::ids::{CompKey, ComputationId, VarKey, VariableId};
use crate::kernel::Inner;
use crate::result::{CellResult, ProblemReason, StructuralError};
use crate::variable::Variable;

pub(crate) struct DefinitionOutcome {
    pub(crate) comp_key: CompKey,
    pub(crate) problems: Vec<StructuralError>,
}

/// Classifies a prospective definition and installs it either as a healthy
/// computation or a quarantined one (§4.6 "Classification at definition
/// time").
pub(crate) fn define_computation(
    inner: &mut Inner,
    id: ComputationId,
    static_inputs: indexmap::IndexSet<VariableId>,
    output_ids: Vec<VariableId>,
    body: BodyFn,
    allow_redefinition: bool,
) -> DefinitionOutcome {
    // Redefinition of an existing id without the opt-in is an operational
    // error (§7.4 "redefine-without-flag"), reported through the status
    // object rather than thrown: the existing computation is left
    // completely untouched. `Kernel::redefine_computation` handles the
    // `allow_redefinition = true` path itself (it needs to save/restore
    // observers, which live outside what this function can see) and always
    // calls back in here with a clean slate, so `allow_redefinition` only
    // ever disarms this one guard.
    if !allow_redefinition {
        if let Some(_existing) = inner.store.comp_key(&id) {
            let error = StructuralError::invalid_definition(id.clone());
            return DefinitionOutcome { comp_key: CompKey(u32::MAX), problems: vec![error] };
        }
    }

    let inputs: Vec<VariableId> = static_inputs.iter().cloned().collect();
    let (missing, problem_inputs) = crate::graph::partition_inputs(&inner.store, &inputs);

    let conflict = output_ids
        .iter()
        .find_map(|o| inner.store.producer_by_output.get(o).cloned());

    let cycle = inner.store.detect_cycle(&id, static_inputs.iter().cloned().collect::<Vec<_>>().as_slice(), &output_ids);

    let mut all_missing = missing.clone();
    all_missing.extend(problem_inputs.iter().cloned());

    if cycle.is_some() || conflict.is_some() || !all_missing.is_empty() {
        let reason = if cycle.is_some() {
            ProblemReason::CircularDependency
        } else if conflict.is_some() {
            ProblemReason::DuplicateOutput
        } else {
            ProblemReason::MissingInput
        };

        // Quarantining an output is itself an externally visible structural
        // edit (clock.rs: "a source write... or certain structural edits");
        // stamping it past `START` keeps V2 (`value_at = 0 iff Uninitialized`)
        // true of a Fatal cell that was never computed.
        let now = inner.clock.tick();
        let mut problems = Vec::new();
        let mut output_keys: Vec<Option<VarKey>> = Vec::new();
        for out_id in &output_ids {
            if inner.store.producer_by_output.contains_key(out_id) {
                // conflicting output: not created, existing owner keeps it.
                output_keys.push(None);
                inner
                    .store
                    .output_waiters
                    .entry(out_id.clone())
                    .or_default()
                    .push(id.clone());
                continue;
            }
            let error = match reason {
                ProblemReason::CircularDependency => {
                    StructuralError::circular_dependency(id.clone(), cycle.clone().unwrap_or_default())
                }
                ProblemReason::DuplicateOutput => StructuralError::duplicate_output(
                    id.clone(),
                    conflict.clone().unwrap_or_else(|| id.clone()),
                ),
                _ => StructuralError::missing_input(id.clone(), all_missing.iter().cloned().collect()),
            };
            let mut var = Variable::new_output(CompKey(u32::MAX));
            var.result = CellResult::Fatal(error.clone());
            var.dirty = false;
            var.cause_at = now;
            var.value_at = now;
            let key = inner.store.insert_variable(out_id.clone(), var);
            output_keys.push(Some(key));
            problems.push(error);
        }

        let primary_error = problems
            .first()
            .cloned()
            .unwrap_or_else(|| match reason {
                ProblemReason::CircularDependency => {
                    StructuralError::circular_dependency(id.clone(), cycle.clone().unwrap_or_default())
                }
                ProblemReason::DuplicateOutput => {
                    StructuralError::duplicate_output(id.clone(), conflict.clone().unwrap_or_else(|| id.clone()))
                }
                _ => StructuralError::missing_input(id.clone(), all_missing.iter().cloned().collect()),
            });

        let comp = Computation {
            def: ComputationDef { id: id.clone(), static_inputs: static_inputs.clone(), output_ids: output_ids.clone(), body },
            status: CompStatus::Problem(Box::new(ProblemState {
                error: primary_error.clone(),
                missing_inputs: all_missing.clone(),
                conflicts_with: conflict.clone(),
            })),
            runtime_inputs: indexmap::IndexSet::new(),
            outputs: output_keys,
            // A quarantined computation never runs; `false` pairs with the
            // `dirty = false` override on its Fatal output cells above, per
            // C3 (the non-conflicting-output branch always creates at least
            // one such cell when `output_keys` is non-empty).
            dirty: false,
            observe_count: 0,
            dirty_input_count: 0,
            cause_at: now,
            input_version: None,
            running_task: None,
            aborting_tasks: FxHashSet::default(),
        };
        let comp_key = inner.store.insert_computation(id.clone(), comp);
        for out_key in inner.store.comp(comp_key).outputs.clone().into_iter().flatten() {
            inner.store.var_mut(out_key).producer = Some(comp_key);
        }

        // Attach dependent edges for inputs that do exist.
        for input in static_inputs.iter() {
            if let Some(key) = inner.store.var_key(input) {
                inner.store.var_mut(key).dependents.insert(comp_key);
            }
        }

        info!("computation `{}` defined as problematic ({:?})", id, reason);
        if let Some(path) = &cycle {
            mark_cycle_members(inner, path, &id);
        }
        return DefinitionOutcome { comp_key, problems };
    }

    // Healthy path.
    let now = inner.clock.current();
    let mut output_keys = Vec::with_capacity(output_ids.len());
    let comp_key_placeholder = CompKey(inner.store.all_comp_keys().count() as u32);
    for out_id in &output_ids {
        let mut var = Variable::new_output(comp_key_placeholder);
        // C2: an output's cause_at always matches its computation's, even
        // freshly (both just inherit the ambient clock — no value was
        // produced yet, so value_at stays at START per V2).
        var.cause_at = now;
        let key = inner.store.insert_variable(out_id.clone(), var);
        output_keys.push(Some(key));
        inner.store.producer_by_output.insert(out_id.clone(), id.clone());
    }

    let comp = Computation {
        def: ComputationDef { id: id.clone(), static_inputs: static_inputs.clone(), output_ids: output_ids.clone(), body },
        status: CompStatus::Normal,
        runtime_inputs: indexmap::IndexSet::new(),
        outputs: output_keys.clone(),
        // Fresh outputs are all dirty (never executed); C3 requires the
        // computation's own flag to agree.
        dirty: true,
        observe_count: 0,
        dirty_input_count: 0,
        cause_at: now,
        input_version: None,
        running_task: None,
        aborting_tasks: FxHashSet::default(),
    };
    let comp_key = inner.store.insert_computation(id.clone(), comp);
    for out_key in output_keys.iter().flatten() {
        inner.store.var_mut(*out_key).producer = Some(comp_key);
    }
    for input in static_inputs.iter() {
        if let Some(key) = inner.store.var_key(input) {
            inner.store.var_mut(key).dependents.insert(comp_key);
        }
    }

    info!("computation `{}` defined healthily", id);

    // Attempt repair of any problem dependents of the new outputs.
    for out_id in &output_ids {
        repair_for_new_variable(inner, out_id.clone());
    }
    recheck_cycles(inner);

    DefinitionOutcome { comp_key, problems: Vec::new() }
}

/// Recursively marks a currently-healthy computation (and its outputs) as
/// problematic, detaching it from its runtime inputs and cascading to its
/// own healthy dependents (§4.6 "Recursive marking").
pub(crate) fn mark_as_problem(inner: &mut Inner, comp_key: CompKey, reason_var: VariableId) {
    let already_problem = inner.store.comp(comp_key).is_problem();
    if already_problem {
        if let CompStatus::Problem(state) = &mut inner.store.comp_mut(comp_key).status {
            state.missing_inputs.insert(reason_var);
        }
        return;
    }

    let comp_id = inner.store.comp_id(comp_key).cloned().unwrap();
    let mut missing = FxHashSet::default();
    missing.insert(reason_var.clone());
    let error = StructuralError::missing_input(comp_id, vec![reason_var]);
    quarantine_healthy(inner, comp_key, error, missing, None);
}

/// Quarantines every other member of a freshly-detected cycle alongside the
/// computation whose definition actually closed the loop (§4.2's cycle
/// detection runs from the new definition's perspective only, but the
/// resulting back-edge path can pass through computations that were
/// already live — healthy or quarantined for an unrelated reason — so they
/// must be reclassified too, or the end-to-end "all three problematic with
/// cyclic" picture never completes). Nodes not found (already removed,
/// or the node that triggered this classification) are skipped.
pub(crate) fn mark_cycle_members(inner: &mut Inner, cycle_path: &[ComputationId], skip: &ComputationId) {
    let mut seen = FxHashSet::default();
    for comp_id in cycle_path {
        if comp_id == skip || !seen.insert(comp_id.clone()) {
            continue;
        }
        let Some(comp_key) = inner.store.comp_key(comp_id) else { continue };
        let error = StructuralError::circular_dependency(comp_id.clone(), cycle_path.to_vec());
        match &inner.store.comp(comp_key).status {
            CompStatus::Normal => {
                quarantine_healthy(inner, comp_key, error, FxHashSet::default(), None);
            }
            CompStatus::Problem(_) => {
                if let CompStatus::Problem(state) = &mut inner.store.comp_mut(comp_key).status {
                    state.error = error.clone();
                }
                // The owned output cells already hold a `Fatal` result from
                // whatever reason quarantined them first; refresh it to the
                // cyclic error too so a variable's result and its owning
                // computation's reported reason never disagree, and
                // re-notify observers with the corrected diagnosis.
                let outputs: Vec<VarKey> = inner.store.comp(comp_key).outputs.iter().flatten().copied().collect();
                for out_key in outputs {
                    let fatal = CellResult::Fatal(error.clone());
                    inner.store.var_mut(out_key).result = fatal.clone();
                    inner.store.var(out_key).observers.notify(&fatal);
                }
            }
        }
    }
}

/// The mechanics shared by every path that turns a *currently-healthy*
/// computation into a quarantined one: cancel in-flight work, detach it
/// from its runtime inputs, replace its outputs with `Fatal` cells, notify
/// their observers, and cascade `missing-input` to its own healthy
/// dependents. Callers differ only in which [`StructuralError`] gets
/// attached and what the resulting problem state's `missing_inputs`/
/// `conflicts_with` should read.
fn quarantine_healthy(
    inner: &mut Inner,
    comp_key: CompKey,
    error: StructuralError,
    missing: FxHashSet<VariableId>,
    conflicts_with: Option<ComputationId>,
) {
    // Quarantine stops execution outright: cancel whatever is in flight so
    // a body never runs to completion against an input that's about to
    // disappear from runtime_inputs.
    if let Some(task) = inner.store.comp(comp_key).running_task.as_ref() {
        task.cancel.cancel();
        inner.store.comp_mut(comp_key).aborting_tasks.insert(task.id);
        inner.store.comp_mut(comp_key).running_task = None;
    }

    let runtime_inputs: Vec<VarKey> = inner.store.comp(comp_key).runtime_inputs.iter().copied().collect();
    for input in &runtime_inputs {
        inner.store.var_mut(*input).dependents.remove(&comp_key);
        crate::propagation::propagate_observe_count(inner, *input, -(inner.store.comp(comp_key).observe_count as i64));
    }
    inner.store.comp_mut(comp_key).runtime_inputs.clear();
    // C4 tracks dirty runtime inputs; there are none left to track.
    inner.store.comp_mut(comp_key).dirty_input_count = 0;

    let outputs: Vec<VarKey> = inner.store.comp(comp_key).outputs.iter().flatten().copied().collect();
    for out_key in &outputs {
        let out_id = inner.store.var_id(*out_key).cloned().unwrap();
        inner.store.producer_by_output.remove(&out_id);
        let was_uninitialized = matches!(inner.store.var(*out_key).result, CellResult::Uninitialized);
        inner.store.var_mut(*out_key).result = CellResult::Fatal(error.clone());
        if was_uninitialized {
            // V2: a never-computed cell stamped Fatal still needs value_at
            // past START now that it's no longer Uninitialized.
            let now = inner.clock.tick();
            inner.store.var_mut(*out_key).value_at = now;
            inner.store.var_mut(*out_key).cause_at = now;
            inner.store.comp_mut(comp_key).cause_at = now;
        }
        let fatal = inner.store.var(*out_key).result.clone();
        inner.store.var(*out_key).observers.notify(&fatal);

        let dependents: Vec<CompKey> = inner.store.var(*out_key).dependents.iter().copied().collect();
        for dep in dependents {
            mark_as_problem(inner, dep, out_id.clone());
        }
    }

    inner.store.comp_mut(comp_key).status = CompStatus::Problem(Box::new(ProblemState {
        error,
        missing_inputs: missing,
        conflicts_with,
    }));
}

/// Sweeps problem computations that were waiting on `new_id` and attempts
/// to recover any now fully satisfied (§4.6 "Repair on each structural
/// event", point 1).
pub(crate) fn repair_for_new_variable(inner: &mut Inner, new_id: VariableId) {
    let candidates: Vec<CompKey> = inner
        .store
        .all_comp_keys()
        .filter(|k| {
            matches!(&inner.store.comp(*k).status, CompStatus::Problem(state) if state.missing_inputs.contains(&new_id))
        })
        .collect();
    for comp_key in candidates {
        if let CompStatus::Problem(state) = &mut inner.store.comp_mut(comp_key).status {
            state.missing_inputs.remove(&new_id);
        }
        try_recover(inner, comp_key);
    }

    promote_output_waiters(inner, &new_id);
}

/// First-win promotion: lets the oldest computation still queued for
/// `out_id` take ownership now that it's free. Shared by
/// [`repair_for_new_variable`] and [`on_removed_variable`] — the latter is
/// the path that actually matters in practice, since a name only frees up
/// by its current owner being removed.
fn promote_output_waiters(inner: &mut Inner, out_id: &VariableId) {
    if let Some(waiters) = inner.store.output_waiters.remove(out_id) {
        for waiter_id in waiters {
            if let Some(waiter_key) = inner.store.comp_key(&waiter_id) {
                try_recover(inner, waiter_key);
            }
        }
    }
}

fn try_recover(inner: &mut Inner, comp_key: CompKey) {
    // `conflicts_with` is diagnostic, not gating: a waiter promoted by
    // `promote_output_waiters` is only ever called once its claimed output
    // is actually free, and `still_conflicting` below re-checks that against
    // live ownership right before committing — so a stale `conflicts_with`
    // must not block recovery the way an unresolved missing input does.
    let ready = match &inner.store.comp(comp_key).status {
        CompStatus::Problem(state) => state.missing_inputs.is_empty(),
        CompStatus::Normal => false,
    };
    if !ready {
        return;
    }

    let (id, static_inputs, output_ids, body) = {
        let comp = inner.store.comp(comp_key);
        (
            comp.def.id.clone(),
            comp.def.static_inputs.clone(),
            comp.def.output_ids.clone(),
            comp.def.body.clone(),
        )
    };

    // Re-verify: a waiter may have raced another waiter to the same output.
    let still_conflicting = output_ids.iter().any(|o| inner.store.producer_by_output.contains_key(o));
    if still_conflicting {
        return;
    }

    // Drop the old (problem) node and re-run full classification fresh,
    // carrying over any observers a host attached to the Fatal placeholder
    // while it waited (same contract as `Kernel::redefine_computation`'s
    // explicit swap — a subscription made before repair must not go silent
    // just because the cell it was watching got torn down and rebuilt).
    let old_outputs: Vec<Option<VarKey>> = inner.store.comp(comp_key).outputs.clone();
    let saved = crate::kernel::save_observers_by_output(inner, &old_outputs);
    for key in old_outputs.into_iter().flatten() {
        inner.store.remove_variable(key);
    }
    inner.store.remove_computation(comp_key);

    let outcome = define_computation(inner, id.clone(), static_inputs, output_ids, body, false);
    crate::kernel::restore_observers_by_output(inner, saved);
    if outcome.problems.is_empty() {
        info!("computation `{}` recovered", id);
    }
}

/// Re-runs cycle detection for every still-problematic node, demoting
/// broken-cycle reasons to `missing-input` and recovering nodes that are
/// now cycle-free and satisfied (§4.6 "Repair on each structural event",
/// point 3).
pub(crate) fn recheck_cycles(inner: &mut Inner) {
    let candidates: Vec<CompKey> = inner
        .store
        .all_comp_keys()
        .filter(|k| matches!(inner.store.comp(*k).status, CompStatus::Problem(ref s) if s.error.reason == ProblemReason::CircularDependency))
        .collect();

    for comp_key in candidates {
        let (id, inputs, outputs) = {
            let comp = inner.store.comp(comp_key);
            (comp.def.id.clone(), comp.def.static_inputs.iter().cloned().collect::<Vec<_>>(), comp.def.output_ids.clone())
        };
        let still_cyclic = inner.store.detect_cycle(&id, &inputs, &outputs).is_some();
        if still_cyclic {
            continue;
        }
        let missing: FxHashSet<VariableId> = inputs
            .iter()
            .filter(|v| inner.store.var_key(v).is_none())
            .cloned()
            .collect();
        if let CompStatus::Problem(state) = &mut inner.store.comp_mut(comp_key).status {
            state.missing_inputs = missing.clone();
            if missing.is_empty() {
                state.error = StructuralError { reason: ProblemReason::MissingInput, ..state.error.clone() };
            } else {
                state.error = StructuralError::missing_input(id.clone(), missing.into_iter().collect());
            }
        }
        try_recover(inner, comp_key);
    }
}

/// Removal cascade for `removeComputation`/`removeSource`: per §9's Open
/// Question (b), only marks dependents as problem — it never cascade-deletes
/// them.
pub(crate) fn on_removed_variable(inner: &mut Inner, removed: VariableId, dependents: Vec<CompKey>) {
    for dep in dependents {
        mark_as_problem(inner, dep, removed.clone());
    }
    inner.store.producer_by_output.remove(&removed);
    promote_output_waiters(inner, &removed);
    recheck_cycles(inner);
}

pub(crate) fn trace_root(inner: &Inner, start_computation: &ComputationId) -> Vec<String> {
    let mut path = Vec::new();
    let mut current = start_computation.clone();
    let mut guard = 0;
    loop {
        guard += 1;
        if guard > 256 {
            path.push("...(truncated)".to_string());
            break;
        }
        let Some(key) = inner.store.comp_key(&current) else { break };
        let CompStatus::Problem(state) = &inner.store.comp(key).status else {
            break;
        };
        if let Some(conflict) = &state.conflicts_with {
            path.push(format!("`{}` conflicts with `{}`", current, conflict));
            break;
        }
        if let Some(missing) = state.missing_inputs.iter().next() {
            path.push(format!("`{}` is missing-input on `{}`", current, missing));
            if let Some(producer_comp) = inner.store.producer_by_output.get(missing) {
                current = producer_comp.clone();
                continue;
            }
            path.push(format!("`{}` is undefined", missing));
            break;
        }
        match state.error.reason {
            ProblemReason::CircularDependency => {
                path.push(format!(
                    "`{}` is part of a cycle: {}",
                    current,
                    state
                        .error
                        .cycle_path
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                ));
                break;
            }
            _ => break,
        }
    }
    path
}
