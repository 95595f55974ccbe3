//! Pure storage plus indexes (§4.2). No scheduling or propagation behavior
//! lives here — just arenas and the lookups that sit on top of them.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::computation::Computation;
use crate::ids::{CompKey, ComputationId, VarKey, VariableId};
use crate::variable::Variable;

/// Owns the two arenas and the name → key indexes. Slots are tombstoned
/// (set to `None`) on removal rather than compacted, so existing keys held
/// elsewhere never dangle into a different node (§9, "arena + stable ids").
#[derive(Default)]
pub(crate) struct GraphStore {
    variables: Vec<Option<Variable>>,
    computations: Vec<Option<Computation>>,

    var_ids: FxHashMap<VariableId, VarKey>,
    comp_ids: FxHashMap<ComputationId, CompKey>,
    var_names: FxHashMap<VarKey, VariableId>,
    comp_names: FxHashMap<CompKey, ComputationId>,

    /// output id -> the computation that currently owns it (healthy or
    /// problem), for duplicate-output detection and first-win bookkeeping.
    pub(crate) producer_by_output: FxHashMap<VariableId, ComputationId>,
    /// output id -> ids of computations quarantined solely (or partly)
    /// because they lost a conflict over that output, in definition order.
    pub(crate) output_waiters: FxHashMap<VariableId, Vec<ComputationId>>,
}

impl GraphStore {
    pub(crate) fn insert_variable(&mut self, id: VariableId, var: Variable) -> VarKey {
        let key = VarKey(self.variables.len() as u32);
        self.variables.push(Some(var));
        self.var_ids.insert(id.clone(), key);
        self.var_names.insert(key, id);
        key
    }

    pub(crate) fn insert_computation(&mut self, id: ComputationId, comp: Computation) -> CompKey {
        let key = CompKey(self.computations.len() as u32);
        self.computations.push(Some(comp));
        self.comp_ids.insert(id.clone(), key);
        self.comp_names.insert(key, id);
        key
    }

    pub(crate) fn remove_variable(&mut self, key: VarKey) -> Option<Variable> {
        let slot = self.variables.get_mut(key.0 as usize)?;
        let var = slot.take()?;
        if let Some(id) = self.var_names.remove(&key) {
            self.var_ids.remove(&id);
        }
        Some(var)
    }

    pub(crate) fn remove_computation(&mut self, key: CompKey) -> Option<Computation> {
        let slot = self.computations.get_mut(key.0 as usize)?;
        let comp = slot.take()?;
        if let Some(id) = self.comp_names.remove(&key) {
            self.comp_ids.remove(&id);
        }
        Some(comp)
    }

    pub(crate) fn var_key(&self, id: &VariableId) -> Option<VarKey> {
        self.var_ids.get(id).copied()
    }

    pub(crate) fn comp_key(&self, id: &ComputationId) -> Option<CompKey> {
        self.comp_ids.get(id).copied()
    }

    pub(crate) fn var_id(&self, key: VarKey) -> Option<&VariableId> {
        self.var_names.get(&key)
    }

    pub(crate) fn comp_id(&self, key: CompKey) -> Option<&ComputationId> {
        self.comp_names.get(&key)
    }

    pub(crate) fn var(&self, key: VarKey) -> &Variable {
        self.variables[key.0 as usize]
            .as_ref()
            .expect("dereferenced a tombstoned VarKey")
    }

    pub(crate) fn var_mut(&mut self, key: VarKey) -> &mut Variable {
        self.variables[key.0 as usize]
            .as_mut()
            .expect("dereferenced a tombstoned VarKey")
    }

    pub(crate) fn try_var(&self, key: VarKey) -> Option<&Variable> {
        self.variables.get(key.0 as usize)?.as_ref()
    }

    pub(crate) fn comp(&self, key: CompKey) -> &Computation {
        self.computations[key.0 as usize]
            .as_ref()
            .expect("dereferenced a tombstoned CompKey")
    }

    pub(crate) fn comp_mut(&mut self, key: CompKey) -> &mut Computation {
        self.computations[key.0 as usize]
            .as_mut()
            .expect("dereferenced a tombstoned CompKey")
    }

    pub(crate) fn try_comp(&self, key: CompKey) -> Option<&Computation> {
        self.computations.get(key.0 as usize)?.as_ref()
    }

    pub(crate) fn all_comp_keys(&self) -> impl Iterator<Item = CompKey> + '_ {
        self.computations
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| CompKey(i as u32)))
    }

    pub(crate) fn all_var_keys(&self) -> impl Iterator<Item = VarKey> + '_ {
        self.variables
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| VarKey(i as u32)))
    }

    /// Runs DFS-with-gray-stack cycle detection over the producer→consumer
    /// graph formed by `{existing shapes} ∪ {candidate}`, where "shape" is
    /// just `(id, inputs, outputs)` — both healthy and quarantined
    /// computations contribute edges, since a quarantined node can still
    /// close a cycle once repaired (§4.2).
    ///
    /// Returns the first back-edge path found, starting and ending at
    /// `candidate_id`.
    pub(crate) fn detect_cycle(
        &self,
        candidate_id: &ComputationId,
        candidate_inputs: &[VariableId],
        candidate_outputs: &[VariableId],
    ) -> Option<Vec<ComputationId>> {
        // Build output -> producing computation id, including the candidate.
        // `producer_by_output` only tracks healthy claims, but a cycle can
        // close through a chain of quarantined nodes (e.g. three mutually
        // circular definitions are all quarantined individually before the
        // loop closes) — so every computation's declared outputs
        // contribute an edge here regardless of its current status, with
        // `producer_by_output` taking priority for any name two
        // computations both claim.
        let mut owner: FxHashMap<&str, &ComputationId> = FxHashMap::default();
        for (out_id, comp_id) in &self.producer_by_output {
            owner.insert(out_id.as_str(), comp_id);
        }
        for key in self.all_comp_keys() {
            let comp = self.comp(key);
            for out_id in &comp.def.output_ids {
                owner.entry(out_id.as_str()).or_insert(&comp.def.id);
            }
        }
        for out_id in candidate_outputs {
            owner.insert(out_id.as_str(), candidate_id);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Gray,
            Black,
        }
        let mut marks: FxHashMap<&str, Mark> = FxHashMap::default();
        let mut stack: Vec<&str> = Vec::new();

        fn successors<'a>(
            this: &'a GraphStore,
            comp_id: &str,
            candidate_id: &'a ComputationId,
            candidate_inputs: &'a [VariableId],
            candidate_outputs: &'a [VariableId],
        ) -> Vec<&'a str> {
            if comp_id == candidate_id.as_str() {
                return candidate_inputs.iter().map(|v| v.as_str()).collect();
            }
            if let Some(key) = this.comp_key(&ComputationId::new(comp_id)) {
                if let Some(comp) = this.try_comp(key) {
                    return comp.def.static_inputs.iter().map(|v| v.as_str()).collect();
                }
            }
            let _ = candidate_outputs;
            Vec::new()
        }

        fn visit<'a>(
            this: &'a GraphStore,
            node: &'a str,
            owner: &FxHashMap<&'a str, &'a ComputationId>,
            marks: &mut FxHashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
            candidate_id: &'a ComputationId,
            candidate_inputs: &'a [VariableId],
            candidate_outputs: &'a [VariableId],
        ) -> Option<Vec<ComputationId>> {
            match marks.get(node) {
                Some(Mark::Black) => return None,
                Some(Mark::Gray) => {
                    let pos = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut path: Vec<ComputationId> =
                        stack[pos..].iter().map(|n| ComputationId::new(*n)).collect();
                    path.push(ComputationId::new(node));
                    return Some(path);
                }
                None => {}
            }
            marks.insert(node, Mark::Gray);
            stack.push(node);
            for input in successors(this, node, candidate_id, candidate_inputs, candidate_outputs) {
                if let Some(&producer) = owner.get(input) {
                    if let Some(cycle) = visit(
                        this,
                        producer.as_str(),
                        owner,
                        marks,
                        stack,
                        candidate_id,
                        candidate_inputs,
                        candidate_outputs,
                    ) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Black);
            None
        }

        visit(
            self,
            candidate_id.as_str(),
            &owner,
            &mut marks,
            &mut stack,
            candidate_id,
            candidate_inputs,
            candidate_outputs,
        )
    }
}

/// Inputs not found in either the normal graph's variable index or the
/// problem-variable set tracked alongside it (the problem table is merged
/// into the same arena per §9, so this just means "no VarKey at all").
pub(crate) fn partition_inputs(
    store: &GraphStore,
    inputs: &[VariableId],
) -> (FxHashSet<VariableId>, FxHashSet<VariableId>) {
    let mut missing = FxHashSet::default();
    let mut problem = FxHashSet::default();
    for input in inputs {
        match store.var_key(input) {
            None => {
                missing.insert(input.clone());
            }
            Some(key) => {
                if matches!(store.var(key).result, crate::result::CellResult::Fatal(_)) {
                    problem.insert(input.clone());
                }
            }
        }
    }
    (missing, problem)
}
