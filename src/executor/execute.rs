use crate::{
    executor::StageLayout,
    stage::{ExecApi, ExecControl, StageOutput, Subscription},
    sync::*,
    types::{HashMap, NodeId},
};
use core::marker::PhantomData;

/// Everything a running stage can reach: the slots of all stages, the
/// node-to-slot index and the invocation's control block.
///
/// Handed down by value to every fork, so it is either a bundle of shared
/// references or, under `loom`, of `Arc`s.
#[cfg(not(feature = "loom"))]
pub(super) struct Run<'a> {
    pub(super) stages: StageSlots<'a>,
    pub(super) outputs: OutputSlots<'a>,
    pub(super) parents: ParentInfoSlots<'a>,
    pub(super) node_to_index: &'a HashMap<NodeId, u32>,
    pub(super) control: &'a ExecControl,
    pub(super) _marker: PhantomData<&'a ()>,
}

#[cfg(feature = "loom")]
pub(super) struct Run<'a: 'static> {
    pub(super) stages: StageSlots<'a>,
    pub(super) outputs: OutputSlots<'a>,
    pub(super) parents: ParentInfoSlots<'a>,
    pub(super) node_to_index: Arc<HashMap<NodeId, u32>>,
    pub(super) control: Arc<ExecControl>,
    pub(super) _marker: PhantomData<&'a ()>,
}

impl Clone for Run<'_> {
    fn clone(&self) -> Self {
        let Self {
            stages,
            outputs,
            parents,
            node_to_index,
            control,
            _marker,
        } = self;
        // Copies the references, or bumps the `Arc`s under `loom`.
        #[allow(suspicious_double_ref_op, noop_method_call)]
        Self {
            stages: stages.clone(),
            outputs: outputs.clone(),
            parents: parents.clone(),
            node_to_index: node_to_index.clone(),
            control: control.clone(),
            _marker: PhantomData,
        }
    }
}

impl ExecApi for Run<'_> {
    fn read(&self, subscription: Subscription) -> &StageOutput {
        let Subscription(node) = subscription;
        let idx = self.node_to_index[&node] as usize;
        // SAFETY: A stage only reads the outputs of its parents, and it is
        // started only after all of them published: the slot is initialized
        // and nobody writes it anymore.
        unsafe {
            self.outputs[idx].get().with(|ptr| {
                ptr.as_ref()
                    .and_then(Option::as_ref)
                    .expect("Run::read: [1]")
            })
        }
    }
}

/// Runs the stages of `ready`, halving the batch across the pool, and then
/// everything they make ready downstream.
///
/// # Safety
///
/// - `run` views the slots of a single executor.
/// - Indexes in `ready` are in bounds and distinct, and every parent of their
///   stages has published its output.
/// - No other thread runs any of these stages concurrently, or ever again in
///   this execution.
pub(super) unsafe fn run_ready(run: Run<'_>, ready: ReadyStages<'_>) {
    match ready.len() {
        0 => {}
        1 => {
            let idx = ready[0] as usize;
            // Just a zero-cost hack for `loom` to work.
            #[allow(noop_method_call)]
            let stages = run.stages.clone();
            // SAFETY: The caller hands this stage to this thread only, so the
            // layout behind `stages[idx]` is not aliased.
            unsafe {
                stages[idx].get_mut().with(|ptr| {
                    ptr.as_mut()
                        .expect("run_ready: [1]")
                        .exec(run, idx);
                });
            }
        }
        _ => {
            let (left, right) = split_ready(ready);
            let rhs = run.clone();
            // SAFETY: `left` and `right` are disjoint, so both halves touch
            // distinct slots.
            unsafe {
                join(|| run_ready(run, left), || run_ready(rhs, right));
            }
        }
    }
}

impl StageLayout {
    /// Evaluates this stage into `outputs[idx]` and schedules its children.
    ///
    /// Owned children are started on this thread right away. A shared child
    /// is started by whichever parent completes last, observed through its
    /// parent counter. Once the invocation is aborted, nothing more is
    /// scheduled.
    ///
    /// # Safety
    ///
    /// - `idx` is the slot of this stage and satisfies the conditions of
    ///   [`run_ready`].
    /// - The layout is executed at most once: its owned children are consumed.
    unsafe fn exec(&mut self, run: Run<'_>, idx: usize) {
        let Self {
            stage,
            owned_children,
            shared_children,
        } = self;
        let output = stage.exec(&run);
        // SAFETY: This stage is the only writer of its output slot, and its
        // children do not read it before the counter protocol below.
        unsafe {
            run.outputs[idx]
                .get_mut()
                .with(|ptr| *ptr.as_mut().expect("StageLayout::exec: [1]") = Some(output));
        }
        if run.control.is_aborted() {
            return;
        }

        let mut ready = core::mem::take(owned_children);
        let num_owned = ready.len();
        if !shared_children.is_empty() {
            fence(Ordering::Release);
        }
        for &child in shared_children.iter() {
            if run.parents[child as usize]
                .parents_left
                .fetch_sub(1, Ordering::Relaxed)
                == 1
            {
                ready.push(child);
            }
        }
        if ready.len() != num_owned {
            fence(Ordering::Acquire);
        }

        // SAFETY: Owned children have this stage as their only parent, and
        // the promoted shared children saw their last parent finish here,
        // after an Acquire fence pairing with their parents' Release fences.
        unsafe { run_ready(run, ready_stages(&ready)) };
    }
}
