//! Destruction of device objects which may still be referenced by in-flight
//! command buffers.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    logging::PrettyList,
    memory::{DeferredResource, MemoryDevice},
    sync::SubmissionTracker,
};

struct PendingDeletion {
    resource: DeferredResource,
    command_buffer: Option<Arc<dyn SubmissionTracker>>,
    fence_counter: u64,
}

impl PendingDeletion {
    fn is_ready(&self) -> bool {
        match &self.command_buffer {
            Some(command_buffer) => {
                self.fence_counter < command_buffer.fence_signaled_counter()
            }
            None => true,
        }
    }
}

/// Holds device objects until the command buffer which last used them has
/// retired its submission.
pub struct DeferredDeletionQueue {
    device: Arc<dyn MemoryDevice>,
    entries: Mutex<Vec<PendingDeletion>>,
}

impl DeferredDeletionQueue {
    pub fn new(device: Arc<dyn MemoryDevice>) -> Self {
        Self {
            device,
            entries: Mutex::new(vec![]),
        }
    }

    /// Schedule `resource` for destruction once `command_buffer` retires the
    /// submission which is current right now.
    ///
    /// Without a command buffer the resource is destroyed on the next call
    /// to [Self::release_resources].
    pub fn enqueue_resource(
        &self,
        resource: DeferredResource,
        command_buffer: Option<Arc<dyn SubmissionTracker>>,
    ) {
        let fence_counter = command_buffer
            .as_ref()
            .map_or(0, |command_buffer| command_buffer.fence_signaled_counter());
        self.lock_entries().push(PendingDeletion {
            resource,
            command_buffer,
            fence_counter,
        });
    }

    /// Destroy every resource whose submission has retired, or every
    /// resource with `delete_immediately`.
    ///
    /// Returns the number of resources destroyed.
    pub fn release_resources(&self, delete_immediately: bool) -> usize {
        let ready: Vec<DeferredResource> = {
            let mut entries = self.lock_entries();
            let (ready, pending): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| delete_immediately || entry.is_ready());
            *entries = pending;
            ready.into_iter().map(|entry| entry.resource).collect()
        };

        for &resource in &ready {
            log::trace!("Destroying {:?}", resource);
            unsafe {
                // Safe because the last submission to use the resource has
                // retired.
                self.device.destroy_object(resource);
            }
        }
        ready.len()
    }

    /// Destroy everything in the queue right away.
    ///
    /// The caller must make sure the device is idle.
    pub fn clear(&self) -> usize {
        self.release_resources(true)
    }

    pub fn num_pending(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn dump_memory(&self) {
        let entries = self.lock_entries();
        let pending: Vec<String> = entries
            .iter()
            .map(|entry| {
                format!("{:?} fence counter {}", entry.resource, entry.fence_counter)
            })
            .collect();
        log::info!(
            "DeferredDeletionQueue {} pending{}",
            pending.len(),
            PrettyList(&pending)
        );
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<PendingDeletion>> {
        self.entries
            .lock()
            .expect("unable to acquire the deferred deletion lock")
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !entries.is_empty() {
            log::error!(
                "{} resources are still waiting for deferred deletion!",
                entries.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use super::*;
    use crate::{memory::FakeDevice, sync::FenceManager, TrackedCommandBuffer};

    fn queue() -> (Arc<FakeDevice>, DeferredDeletionQueue) {
        let device = Arc::new(FakeDevice::new());
        let queue = DeferredDeletionQueue::new(device.clone());
        (device, queue)
    }

    fn sampler(raw: u64) -> DeferredResource {
        DeferredResource::Sampler(vk::Sampler::from_raw(raw))
    }

    #[test]
    fn resources_without_a_command_buffer_go_on_the_next_pass() {
        let (device, queue) = queue();
        queue.enqueue_resource(sampler(1), None);

        assert_eq!(queue.release_resources(false), 1);

        assert_eq!(device.destroyed_objects(), vec![sampler(1)]);
        assert_eq!(queue.num_pending(), 0);
    }

    #[test]
    fn resources_wait_for_their_submission_to_retire() {
        let (device, queue) = queue();
        let fences = FenceManager::new(device.clone(), true);
        let command_buffer = Arc::new(TrackedCommandBuffer::new(
            vk::CommandBuffer::from_raw(7),
        ));
        let fence = fences.allocate_fence().unwrap();
        let raw_fence = fence.raw();
        command_buffer.submitted(fence);

        queue.enqueue_resource(sampler(1), Some(command_buffer.clone()));
        let image = DeferredResource::Image(device.new_image());
        queue.enqueue_resource(image, None);

        assert_eq!(queue.release_resources(false), 1);
        assert_eq!(device.destroyed_objects(), vec![image]);
        assert_eq!(queue.num_pending(), 1);

        device.signal_fence(raw_fence);
        assert!(command_buffer.refresh_fence_state(&fences).unwrap());

        assert_eq!(queue.release_resources(false), 1);
        assert_eq!(device.destroyed_objects(), vec![image, sampler(1)]);
        assert_eq!(queue.num_pending(), 0);
    }

    #[test]
    fn clear_destroys_everything() {
        let (device, queue) = queue();
        let command_buffer = Arc::new(TrackedCommandBuffer::new(
            vk::CommandBuffer::from_raw(7),
        ));
        queue.enqueue_resource(sampler(1), Some(command_buffer.clone()));
        queue.enqueue_resource(sampler(2), Some(command_buffer));

        assert_eq!(queue.clear(), 2);

        assert_eq!(device.destroyed_objects().len(), 2);
        assert_eq!(queue.num_pending(), 0);
    }

    #[test]
    fn dropping_the_queue_leaves_pending_resources_alone() {
        let (device, queue) = queue();
        let command_buffer = Arc::new(TrackedCommandBuffer::new(
            vk::CommandBuffer::from_raw(7),
        ));
        queue.enqueue_resource(sampler(1), Some(command_buffer));

        drop(queue);

        assert!(device.destroyed_objects().is_empty());
    }
}
