use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use ash::vk;

use super::{Fence, FenceManager};
use crate::MemoryError;

/// Something which submits GPU work and counts how many of its submissions
/// have finished.
///
/// Deferred reclamation records the counter when a resource is released and
/// waits until the counter has moved past it.
pub trait SubmissionTracker: Send + Sync {
    /// The number of submissions which are known to have finished. Never
    /// decreases.
    fn fence_signaled_counter(&self) -> u64;
}

/// A command buffer paired with the fence of its in-flight submission.
pub struct TrackedCommandBuffer {
    raw: vk::CommandBuffer,
    fence_signaled_counter: AtomicU64,
    in_flight: Mutex<Option<Fence>>,
}

impl TrackedCommandBuffer {
    pub fn new(raw: vk::CommandBuffer) -> Self {
        Self {
            raw,
            fence_signaled_counter: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Record that the command buffer was submitted with `fence`.
    ///
    /// # Panics
    ///
    /// Panics if the previous submission has not been retired.
    pub fn submitted(&self, fence: Fence) {
        let mut in_flight = self.lock_in_flight();
        assert!(
            in_flight.is_none(),
            "Command buffer {:?} was submitted while still in flight",
            self.raw
        );
        *in_flight = Some(fence);
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock_in_flight().is_some()
    }

    /// Poll the in-flight fence. When it has signaled the fence goes back to
    /// the manager and the counter moves forward.
    ///
    /// Returns true when a submission was retired by this call.
    pub fn refresh_fence_state(
        &self,
        fences: &FenceManager,
    ) -> Result<bool, MemoryError> {
        let mut in_flight = self.lock_in_flight();
        let Some(fence) = in_flight.as_mut() else {
            return Ok(false);
        };
        if !fences.is_fence_signaled(fence)? {
            return Ok(false);
        }
        self.retire(&mut in_flight, fences)?;
        Ok(true)
    }

    /// Block until the in-flight submission finishes or the timeout elapses.
    ///
    /// Returns false on timeout. A command buffer with nothing in flight is
    /// already finished.
    pub fn wait(
        &self,
        fences: &FenceManager,
        timeout_in_nanoseconds: u64,
    ) -> Result<bool, MemoryError> {
        let mut in_flight = self.lock_in_flight();
        let Some(fence) = in_flight.as_mut() else {
            return Ok(true);
        };
        if !fences.wait_for_fence(fence, timeout_in_nanoseconds)? {
            return Ok(false);
        }
        self.retire(&mut in_flight, fences)?;
        Ok(true)
    }

    fn retire(
        &self,
        in_flight: &mut Option<Fence>,
        fences: &FenceManager,
    ) -> Result<(), MemoryError> {
        if let Some(fence) = in_flight.take() {
            self.fence_signaled_counter.fetch_add(1, Ordering::AcqRel);
            fences.release_fence(fence)?;
        }
        Ok(())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<Fence>> {
        self.in_flight
            .lock()
            .expect("unable to acquire the command buffer fence lock")
    }
}

impl SubmissionTracker for TrackedCommandBuffer {
    fn fence_signaled_counter(&self) -> u64 {
        self.fence_signaled_counter.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk::Handle;

    use super::*;
    use crate::memory::FakeDevice;

    fn setup() -> (Arc<FakeDevice>, FenceManager, TrackedCommandBuffer) {
        let device = Arc::new(FakeDevice::new());
        let fences = FenceManager::new(device.clone(), true);
        let command_buffer =
            TrackedCommandBuffer::new(vk::CommandBuffer::from_raw(42));
        (device, fences, command_buffer)
    }

    #[test]
    fn counter_moves_when_the_submission_retires() {
        let (device, fences, command_buffer) = setup();
        let fence = fences.allocate_fence().unwrap();
        let raw = fence.raw();
        command_buffer.submitted(fence);

        assert!(!command_buffer.refresh_fence_state(&fences).unwrap());
        assert_eq!(command_buffer.fence_signaled_counter(), 0);

        device.signal_fence(raw);
        assert!(command_buffer.refresh_fence_state(&fences).unwrap());
        assert_eq!(command_buffer.fence_signaled_counter(), 1);
        assert!(!command_buffer.is_in_flight());
        assert_eq!(fences.num_free_fences(), 1);

        assert!(!command_buffer.refresh_fence_state(&fences).unwrap());
        assert_eq!(command_buffer.fence_signaled_counter(), 1);
    }

    #[test]
    fn wait_retires_a_signaled_submission() {
        let (device, fences, command_buffer) = setup();
        let fence = fences.allocate_fence().unwrap();
        let raw = fence.raw();
        command_buffer.submitted(fence);

        assert!(!command_buffer.wait(&fences, 1_000).unwrap());
        device.signal_fence(raw);
        assert!(command_buffer.wait(&fences, 1_000).unwrap());

        assert_eq!(command_buffer.fence_signaled_counter(), 1);
        assert!(command_buffer.wait(&fences, 1_000).unwrap());
    }
}
