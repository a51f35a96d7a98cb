//! Deferred resource destruction (§4.5, §9): the registry's whole job is
//! holding resources whose ref-count has already reached zero until it is
//! safe, against the device timeline, to actually call the driver's
//! `vkDestroy*`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::resource::{DestroyContext, Resource};

struct Pending {
    /// The highest-numbered submission that could still reference this
    /// resource; destruction waits until that submission has completed (§9).
    ready_at: u64,
    resource: Resource,
}

/// Queue of resources whose ref-count reached zero but which may still be
/// referenced by an in-flight command buffer (§4.5). Drained by submission
/// completion notifications or an explicit `vkDeviceWaitIdle`.
pub struct DeferredDestroyQueue {
    pending: Mutex<Vec<Pending>>,
    last_completed_submission: AtomicU64,
}

impl DeferredDestroyQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            last_completed_submission: AtomicU64::new(0),
        }
    }

    pub(crate) fn enqueue(&self, ready_at: u64, resource: Resource) {
        self.pending.lock().push(Pending { ready_at, resource });
    }

    /// Call when the device reports that `submission_index` has completed.
    /// Destroys every resource that was waiting on it or an earlier one.
    pub fn notify_submission_completed(&self, submission_index: u64, ctx: &DestroyContext<'_>) {
        self.last_completed_submission
            .fetch_max(submission_index, Ordering::AcqRel);
        self.drain_ready(submission_index, ctx);
    }

    fn drain_ready(&self, completed: u64, ctx: &DestroyContext<'_>) {
        let to_destroy = {
            let mut pending = self.pending.lock();
            let (still_pending, to_destroy): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.ready_at > completed);
            *pending = still_pending;
            to_destroy
        };
        for p in to_destroy {
            p.resource.destroy(ctx);
        }
    }

    /// Destroy every pending resource unconditionally. Only valid to call
    /// once the device is known idle (after `vkDeviceWaitIdle`), since this
    /// ignores `ready_at` entirely (§4.5 "At device shutdown...").
    pub fn drain_all(&self, ctx: &DestroyContext<'_>) {
        let mut pending = self.pending.lock();
        let all: Vec<_> = pending.drain(..).collect();
        drop(pending);
        for p in all {
            p.resource.destroy(ctx);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for DeferredDestroyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_without_drain_keeps_count() {
        let queue = DeferredDestroyQueue::new();
        // Fences/submissions are just u64s here; no device calls happen
        // until a drain, so we can exercise the bookkeeping without Vulkan.
        queue.enqueue(5, Resource::Fence(ash::vk::Fence::null()));
        queue.enqueue(3, Resource::Fence(ash::vk::Fence::null()));
        assert_eq!(queue.pending_count(), 2);
    }
}
