#[cfg(feature = "loom")]
mod imp {
    use crate::executor::{OutputSlot, ParentInfoSlot, StageSlot};
    pub(crate) use loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicU32, Ordering, fence},
        thread,
    };
    pub(crate) use std::sync::Arc;

    pub(crate) type StageSlots<'a> = Arc<Vec<StageSlot>>;
    pub(crate) type OutputSlots<'a> = Arc<Vec<OutputSlot>>;
    pub(crate) type ParentInfoSlots<'a> = Arc<Vec<ParentInfoSlot>>;
    pub(crate) type ReadyStages<'a> = Arc<[u32]>;

    pub(crate) fn ready_stages(stages: &[u32]) -> ReadyStages<'static> {
        Arc::from(stages)
    }

    pub(crate) fn split_ready(ready: ReadyStages<'_>) -> (ReadyStages<'_>, ReadyStages<'_>) {
        let (left, right) = ready.split_at(ready.len() / 2);
        (Arc::from(left), Arc::from(right))
    }

    pub(crate) fn join(lhs: impl FnOnce() + Send + 'static, rhs: impl FnOnce() + Send + 'static) {
        let lhs = thread::spawn(lhs);
        let rhs = thread::spawn(rhs);
        lhs.join().unwrap();
        rhs.join().unwrap();
    }

    /// Sequential under the model checker: loom only explores the scheduler.
    pub(crate) fn map_ordered<T: Send, R: Send>(
        items: Vec<T>,
        f: impl Fn(T) -> R + Sync + Send,
    ) -> Vec<R> {
        items.into_iter().map(f).collect()
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use crate::executor::{OutputSlot, ParentInfoSlot, StageSlot};
    pub(crate) use core::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
    use rayon::iter::{IntoParallelIterator, ParallelIterator};

    pub(crate) type StageSlots<'a> = &'a [StageSlot];
    pub(crate) type OutputSlots<'a> = &'a [OutputSlot];
    pub(crate) type ParentInfoSlots<'a> = &'a [ParentInfoSlot];
    /// Stage indexes that can start right away.
    pub(crate) type ReadyStages<'a> = &'a [u32];

    pub(crate) fn ready_stages(stages: &[u32]) -> ReadyStages<'_> {
        stages
    }

    pub(crate) fn split_ready(ready: ReadyStages<'_>) -> (ReadyStages<'_>, ReadyStages<'_>) {
        ready.split_at(ready.len() / 2)
    }

    pub(crate) fn join(lhs: impl FnOnce() + Send, rhs: impl FnOnce() + Send) {
        rayon::join(lhs, rhs);
    }

    /// Maps `items` on the current rayon pool, keeping input order in the
    /// result.
    pub(crate) fn map_ordered<T: Send, R: Send>(
        items: Vec<T>,
        f: impl Fn(T) -> R + Sync + Send,
    ) -> Vec<R> {
        items.into_par_iter().map(f).collect()
    }

    /// The subset of `loom::cell::UnsafeCell` the executor uses, over the
    /// core cell, so that slot accesses read the same under both.
    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        pub(crate) const fn new(value: T) -> Self {
            Self(core::cell::UnsafeCell::new(value))
        }

        pub(crate) fn get(&self) -> ConstPtr<T> {
            ConstPtr(self.0.get())
        }

        pub(crate) fn get_mut(&self) -> MutPtr<T> {
            MutPtr(self.0.get())
        }

        pub(crate) fn into_inner(self) -> T {
            self.0.into_inner()
        }
    }

    pub(crate) struct ConstPtr<T>(*const T);

    impl<T> ConstPtr<T> {
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0)
        }
    }

    pub(crate) struct MutPtr<T>(*mut T);

    impl<T> MutPtr<T> {
        pub(crate) fn with<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0)
        }
    }
}

pub(crate) use imp::*;
