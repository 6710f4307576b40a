mod execute;
mod setup;

use crate::{
    executor::{
        execute::{Run, run_ready},
        setup::StageSetupApiImpl,
    },
    optimizer::RealizedGraph,
    stage::{ExecControl, Stage, StageOutput},
    sync::{AtomicU32, ready_stages},
    types::{HashMap, HashSet, IndexMap, IndexSet, NodeId, SyncUnsafeCell},
};
use core::marker::PhantomData;
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use std::{collections::VecDeque, sync::Arc};
use unzip3::Unzip3;

/// Concurrent DAG executor running the stages of one realized graph.
///
/// Key responsibilities:
/// - Computes a topological order of the stages, roots first, and maps each
///   `NodeId` to an index.
/// - Splits children into `owned` (single parent) and `shared` (multiple
///   parents) to minimize synchronization during `execute`.
/// - Executes independent roots in parallel and propagates readiness downstream
///   using a fence+counter protocol for shared children.
///
/// An executor runs once: counters and child lists are consumed by
/// `execute`.
#[must_use]
#[derive(Debug)]
pub(crate) struct Executor {
    stages: Vec<StageSlot>,
    outputs: Vec<OutputSlot>,
    parents: Vec<ParentInfoSlot>,
    /// Slots of the stages without parents: a prefix of the slot order.
    independent_stages: Vec<u32>,
    node_to_index: HashMap<NodeId, u32>,
    control: Arc<ExecControl>,
}

pub(crate) type StageSlot = SyncUnsafeCell<StageLayout>;

#[must_use]
#[derive(Debug)]
pub(crate) struct StageLayout {
    /// Current stage.
    stage: Stage,
    /// Indexes of the downstream stages that depend on the current stage only.
    /// They can be started right after it completes without any
    /// multithread synchronization.
    owned_children: Vec<u32>,
    /// Indexes of the downstream stages that have other parents too.
    shared_children: Vec<u32>,
}

#[must_use]
#[derive(Debug)]
#[repr(align(128))]
pub(crate) struct ParentInfoSlot {
    /// Number of parent stages that haven't finished yet.
    parents_left: AtomicU32,
}

pub(crate) type OutputSlot = SyncUnsafeCell<Option<StageOutput>>;

struct StageSetupLayout<'a> {
    stage_idx: u32,
    parents: Option<&'a IndexSet<NodeId>>,
    children: Option<&'a IndexSet<NodeId>>,
}

impl Executor {
    /// Builds one stage per realized node and orders them:
    /// - stages declare their parents through `SetupApi::subscribe`,
    /// - stages without parents come first,
    /// - the others follow in Kahn order.
    ///
    /// # Panics
    /// In case of internal invariant violations. Impossible if there are no
    /// bugs in the code.
    pub(crate) fn setup(realized: &RealizedGraph, control: &Arc<ExecControl>) -> Self {
        // Phase 1: Instantiate stages and record the dependency maps filled by
        // their subscriptions.
        let max_cap = realized.len().saturating_sub(1);
        let mut child_to_parents = IndexMap::with_capacity_and_hasher(max_cap, FxBuildHasher);
        let mut parent_to_children = IndexMap::with_capacity_and_hasher(max_cap, FxBuildHasher);
        let mut stages = IndexMap::with_capacity_and_hasher(realized.len(), FxBuildHasher);
        for (current_node, node) in realized.iter() {
            let mut setup_api = StageSetupApiImpl {
                current_node,
                realized,
                child_to_parents: &mut child_to_parents,
                parent_to_children: &mut parent_to_children,
            };
            let stage = Stage::setup(&mut setup_api, current_node, node, Arc::clone(control));
            stages.insert(current_node, stage);
        }

        // Phase 2: Seed the order with roots (stages without parents).
        let mut stage_info_map: IndexMap<_, _> = stages
            .keys()
            .filter(|key| !child_to_parents.contains_key(*key))
            .copied()
            .enumerate()
            .map(|(idx, id)| {
                (
                    id,
                    StageSetupLayout {
                        stage_idx: idx.try_into().expect("Executor::setup: [1]"),
                        parents: None,
                        children: parent_to_children.get(&id),
                    },
                )
            })
            .collect();
        assert!(
            stages.is_empty() || !stage_info_map.is_empty(),
            "Executor::setup: [2]"
        );
        let num_independent_stages: u32 = stage_info_map.len().try_into().expect("Executor::setup: [3]");

        // Phase 3: Kahn-like processing. A candidate is placed once all of its
        // parents are; otherwise it is re-enqueued by its last missing parent.
        let max_cap = stages.len() - stage_info_map.len();
        let mut pending_queue = VecDeque::with_capacity(max_cap);
        let mut pending_set = HashSet::with_capacity_and_hasher(max_cap, FxBuildHasher);
        for stage_info in stage_info_map.values() {
            for &child in stage_info.children.into_iter().flatten() {
                if pending_set.insert(child) {
                    pending_queue.push_back(child);
                }
            }
        }

        'process_pending: while let Some(node) = pending_queue.pop_front() {
            let removed = pending_set.remove(&node);
            assert!(removed, "Executor::setup: [4]");
            let parents = child_to_parents.get(&node).expect("Executor::setup: [5]");
            for parent in parents {
                if !stage_info_map.contains_key(parent) {
                    continue 'process_pending;
                }
            }
            let children = parent_to_children.get(&node);
            let layout = StageSetupLayout {
                stage_idx: stage_info_map.len().try_into().expect("Executor::setup: [6]"),
                parents: Some(parents),
                children,
            };
            let inserted_new = stage_info_map.insert(node, layout).is_none();
            assert!(inserted_new, "Executor::setup: [7]");
            for &child in children.into_iter().flatten() {
                if pending_set.insert(child) {
                    pending_queue.push_back(child);
                }
            }
        }
        drop(pending_queue);
        drop(pending_set);
        // Realized graphs are acyclic by construction.
        assert_eq!(stage_info_map.len(), stages.len(), "Executor::setup: [8]");

        // Phase 4: Materialize stage and output slots in topological order and
        // classify children into owned and shared ones.
        let (stage_slots, output_slots, parents) = stage_info_map
            .iter()
            .enumerate()
            .map(|(idx, (node, stage_info))| {
                let &StageSetupLayout {
                    stage_idx,
                    parents,
                    children,
                } = stage_info;
                assert_eq!(idx, stage_idx as usize, "Executor::setup: [9]");
                let parents_total = parents
                    .map_or(0, IndexSet::len)
                    .try_into()
                    .expect("Executor::setup: [10]");
                let mut owned_children = vec![];
                let mut shared_children = vec![];
                for child in children.into_iter().flatten() {
                    let parents = &child_to_parents[child];
                    let idx = stage_info_map[child].stage_idx;
                    if parents.len() == 1 {
                        assert_eq!(
                            parents.first().expect("Executor::setup: [11]"),
                            node,
                            "Executor::setup: [12]"
                        );
                        owned_children.push(idx);
                    } else {
                        shared_children.push(idx);
                    }
                }
                // Sorted for better cache locality.
                owned_children.sort_unstable();
                shared_children.sort_unstable();
                let stage_slot = StageSlot::new(StageLayout {
                    stage: stages.swap_remove(node).expect("Executor::setup: [13]"),
                    owned_children,
                    shared_children,
                });
                let parent_info_slot = ParentInfoSlot {
                    parents_left: AtomicU32::new(parents_total),
                };
                (stage_slot, OutputSlot::new(None), parent_info_slot)
            })
            .unzip3();
        assert!(stages.is_empty(), "Executor::setup: [14]");

        Self {
            stages: stage_slots,
            outputs: output_slots,
            parents,
            independent_stages: (0..num_independent_stages).collect(),
            node_to_index: stage_info_map
                .into_iter()
                .map(|(node, info)| (node, info.stage_idx))
                .collect(),
            control: Arc::clone(control),
        }
    }

    /// Executes the stages in a parallel, dependency-respecting manner.
    ///
    /// Independent roots are joined in parallel. When a stage finishes, it:
    /// - Optionally performs a Release fence if it has shared children,
    /// - Decrements each shared child's `parents_left` (Relaxed),
    /// - If a decrement observes the counter reach zero, appends that child to
    ///   the owned set and performs an Acquire fence before executing it.
    ///
    /// Stages downstream of an aborted invocation are never started.
    #[cfg(not(feature = "loom"))]
    pub(crate) fn execute(self) -> Self {
        let run = Run {
            stages: &self.stages,
            outputs: &self.outputs,
            parents: &self.parents,
            node_to_index: &self.node_to_index,
            control: &self.control,
            _marker: PhantomData,
        };
        // SAFETY: The independent stages have no parents, and each slot is
        // reached once: from the roots, through its single owner, or through
        // its last finishing parent.
        unsafe { run_ready(run, ready_stages(&self.independent_stages)) };
        self
    }

    /// Loom-testable version of `execute`.
    #[cfg(feature = "loom")]
    pub(crate) fn execute(self) -> Self {
        let Self {
            stages,
            outputs,
            parents,
            independent_stages,
            node_to_index,
            control,
        } = self;

        let stages = Arc::new(stages);
        let outputs = Arc::new(outputs);
        let parents = Arc::new(parents);
        let node_to_index = Arc::new(node_to_index);

        let run = Run {
            stages: stages.clone(),
            outputs: outputs.clone(),
            parents: parents.clone(),
            node_to_index: node_to_index.clone(),
            control: control.clone(),
            _marker: PhantomData,
        };
        // SAFETY: Same scheduling guarantees as the non-loom version.
        unsafe { run_ready(run, ready_stages(&independent_stages)) };

        Self {
            stages: Arc::into_inner(stages).expect("Executor::execute: [1]"),
            outputs: Arc::into_inner(outputs).expect("Executor::execute: [2]"),
            parents: Arc::into_inner(parents).expect("Executor::execute: [3]"),
            independent_stages,
            node_to_index: Arc::into_inner(node_to_index).expect("Executor::execute: [4]"),
            control,
        }
    }

    /// Consumes the executor, returning the output of every stage that ran,
    /// by node id. Stages skipped after an abort have none.
    pub(crate) fn into_outputs(self) -> Vec<(NodeId, StageOutput)> {
        let Self {
            outputs,
            node_to_index,
            ..
        } = self;
        let mut outputs: Vec<Option<StageOutput>> = outputs.into_iter().map(SyncUnsafeCell::into_inner).collect();
        let mut result: Vec<(NodeId, StageOutput)> = node_to_index
            .into_iter()
            .filter_map(|(node, idx)| Some((node, outputs[idx as usize].take()?)))
            .collect();
        result.sort_unstable_by_key(|(node, _)| *node);
        result
    }
}
