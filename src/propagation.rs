//! Downward (`cause_at`/dirty) and upward (`observe_count`) propagation
//! (§4.3). Both are synchronous, re-entrant, and bounded by graph depth.

use log::trace;

use crate::clock::LogicalClock;
use crate::computation::Transition;
use crate::ids::{CompKey, VarKey};
use crate::kernel::Inner;

/// Downward propagation: pushes a new cause time (and, on the triggering
/// edge, a dirty flip) from `source` into `comp` and recursively into every
/// downstream dependent (§4.3.1).
///
/// `is_new_dirty` is the edge-local "did this consumer's input just become
/// dirty" signal, distinct from whether `cause_at` itself rose — it is what
/// keeps `dirty_input_count` correct across diamonds.
pub(crate) fn propagate_cause_downward(
    inner: &mut Inner,
    comp_key: CompKey,
    new_cause: LogicalClock,
    source: VarKey,
    is_new_dirty: bool,
) {
    // Step 1: bump dirty_input_count on the triggering edge only.
    if is_new_dirty {
        let source_is_dirty_computed = {
            let source_var = inner.store.var(source);
            source_var.dirty && source_var.producer.is_some()
        };
        if source_is_dirty_computed {
            let comp = inner.store.comp_mut(comp_key);
            let new_count = comp.dirty_input_count + 1;
            let transition = comp.set_dirty_input_count(new_count);
            crate::scheduler::apply_transition(inner, comp_key, transition);
        }
    }

    // Step 2/3: cause monotonicity guard, then the cause_at write.
    {
        let comp = inner.store.comp(comp_key);
        if new_cause <= comp.cause_at {
            return;
        }
    }
    {
        let comp = inner.store.comp_mut(comp_key);
        let transition = comp.set_cause_at(new_cause);
        crate::scheduler::apply_transition(inner, comp_key, transition);
    }

    // Step 4: dirty = true.
    {
        let comp = inner.store.comp_mut(comp_key);
        let transition = comp.set_dirty(true);
        crate::scheduler::apply_transition(inner, comp_key, transition);
    }

    // Step 5: cascade through owned outputs.
    let outputs: Vec<VarKey> = inner.store.comp(comp_key).outputs.iter().flatten().copied().collect();
    for output in outputs {
        let was_dirty = inner.store.var(output).dirty;
        {
            let var = inner.store.var_mut(output);
            var.cause_at = new_cause;
            var.dirty = true;
        }
        let dependents: Vec<CompKey> = inner.store.var(output).dependents.iter().copied().collect();
        trace!(
            "propagate_cause_downward: output {:?} -> {} dependents",
            output,
            dependents.len()
        );
        for dependent in dependents {
            propagate_cause_downward(inner, dependent, new_cause, output, !was_dirty);
        }
    }
}

/// Upward propagation: adjusts `observe_count` on a variable, its producer
/// (if any), and recursively that producer's runtime inputs (§4.3.2).
pub(crate) fn propagate_observe_count(inner: &mut Inner, var: VarKey, delta: i64) {
    {
        let v = inner.store.var_mut(var);
        v.observe_count = (v.observe_count as i64 + delta).max(0) as u32;
    }

    let producer = inner.store.var(var).producer;
    let Some(comp_key) = producer else { return };

    let (new_count, stale_reschedule) = {
        let comp = inner.store.comp(comp_key);
        let new_count = (comp.observe_count as i64 + delta).max(0) as u32;
        let stale = delta > 0
            && !comp.dirty
            && comp
                .runtime_inputs
                .iter()
                .map(|k| inner.store.var(*k).value_at)
                .max()
                .map(|max_value_at| comp.input_version.is_none() || comp.input_version.unwrap() < max_value_at)
                .unwrap_or(false);
        (new_count, stale)
    };

    {
        let comp = inner.store.comp_mut(comp_key);
        let transition = comp.set_observe_count(new_count);
        crate::scheduler::apply_transition(inner, comp_key, transition);
    }

    let runtime_inputs: Vec<VarKey> = inner.store.comp(comp_key).runtime_inputs.iter().copied().collect();
    for input in &runtime_inputs {
        propagate_observe_count(inner, *input, delta);
    }

    if stale_reschedule {
        let max_input_cause = runtime_inputs
            .iter()
            .map(|k| inner.store.var(*k).cause_at)
            .max()
            .unwrap_or(LogicalClock::START);
        let comp_cause = inner.store.comp(comp_key).cause_at;
        if max_input_cause > comp_cause {
            propagate_cause_downward(inner, comp_key, max_input_cause, var, false);
        }
    }
}

/// Cascades a newly-clean result to a variable's observers and dependents
/// (§4.5 step 6's `cleanVariable`).
pub(crate) fn clean_variable(inner: &mut Inner, var: VarKey) {
    let result = inner.store.var(var).result.clone();
    inner.store.var(var).observers.notify(&result);

    let dependents: Vec<CompKey> = inner.store.var(var).dependents.iter().copied().collect();
    for dep in dependents {
        let is_computed_dirty = {
            let comp = inner.store.comp(dep);
            comp.runtime_inputs.contains(&var) && inner.store.var(var).producer.is_some()
        };
        if is_computed_dirty {
            let comp = inner.store.comp_mut(dep);
            if comp.dirty_input_count > 0 {
                let new_count = comp.dirty_input_count - 1;
                let transition = comp.set_dirty_input_count(new_count);
                crate::scheduler::apply_transition(inner, dep, transition);
            }
        }
    }
}
