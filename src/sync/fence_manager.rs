use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;

use super::{Fence, FenceState};
use crate::{memory::MemoryDevice, MemoryError};

#[derive(Default)]
struct FenceManagerState {
    free_fences: Vec<vk::Fence>,
    used_fences: HashSet<vk::Fence>,

    /// Released fences which had not signaled yet. They may still belong to
    /// a queue submission so they only rejoin the pool once they signal.
    awaiting_signal: Vec<vk::Fence>,
}

/// Hands out fences and recycles them once they have been consumed.
///
/// The manager is the single place which asks the device whether submitted
/// work has finished.
pub struct FenceManager {
    device: Arc<dyn MemoryDevice>,
    reuse_fences: bool,
    state: Mutex<FenceManagerState>,
}

impl FenceManager {
    /// Create a manager. When `reuse_fences` is false, released fences are
    /// destroyed instead of pooled.
    pub fn new(device: Arc<dyn MemoryDevice>, reuse_fences: bool) -> Self {
        Self {
            device,
            reuse_fences,
            state: Mutex::new(FenceManagerState::default()),
        }
    }

    /// Take a fence from the pool, or create a new one. The fence is not
    /// signaled.
    pub fn allocate_fence(&self) -> Result<Fence, MemoryError> {
        let mut state = self.lock_state();
        self.recycle_signaled_fences(&mut state);
        let raw = match state.free_fences.pop() {
            Some(raw) => raw,
            None => unsafe {
                self.device
                    .create_fence()
                    .map_err(MemoryError::UnableToCreateFence)?
            },
        };
        state.used_fences.insert(raw);
        Ok(Fence::new(raw))
    }

    /// Poll the fence once unless it is already known to be signaled.
    pub fn is_fence_signaled(
        &self,
        fence: &mut Fence,
    ) -> Result<bool, MemoryError> {
        if fence.is_signaled() {
            return Ok(true);
        }
        self.check_owned(fence)?;
        let signaled = self
            .device
            .get_fence_status(fence.raw)
            .map_err(MemoryError::UnexpectedFenceStatusError)?;
        if signaled {
            fence.mark_signaled();
        }
        Ok(signaled)
    }

    /// Block until the fence signals or the timeout elapses.
    ///
    /// Returns false if the wait timed out.
    pub fn wait_for_fence(
        &self,
        fence: &mut Fence,
        timeout_in_nanoseconds: u64,
    ) -> Result<bool, MemoryError> {
        if fence.is_signaled() {
            return Ok(true);
        }
        self.check_owned(fence)?;
        let signaled = self
            .device
            .wait_for_fence(fence.raw, timeout_in_nanoseconds)
            .map_err(MemoryError::UnexpectedFenceWaitError)?;
        if signaled {
            fence.mark_signaled();
        }
        Ok(signaled)
    }

    /// Give a fence back to the manager.
    ///
    /// Signaled fences are reset before they go back into the pool. A fence
    /// which has not signaled is held aside until it does. If the device
    /// fails to report or reset the fence, it is destroyed and the error is
    /// returned.
    pub fn release_fence(&self, mut fence: Fence) -> Result<(), MemoryError> {
        let raw = fence.raw;
        fence.raw = vk::Fence::null();

        let mut state = self.lock_state();
        if !state.used_fences.remove(&raw) {
            // The handle belongs to another manager, leave it alone.
            return Err(MemoryError::FenceNotOwnedByManager(raw));
        }

        let signaled = fence.state == FenceState::Signaled
            || match self.device.get_fence_status(raw) {
                Ok(signaled) => signaled,
                Err(err) => {
                    unsafe { self.device.destroy_fence(raw) };
                    return Err(MemoryError::UnexpectedFenceStatusError(err));
                }
            };
        if signaled {
            self.recycle(&mut state, raw)
        } else {
            state.awaiting_signal.push(raw);
            Ok(())
        }
    }

    /// Wait for the fence unless it is already signaled, then release it.
    ///
    /// Returns whether the fence signaled before the timeout.
    pub fn wait_and_release_fence(
        &self,
        mut fence: Fence,
        timeout_in_nanoseconds: u64,
    ) -> Result<bool, MemoryError> {
        let signaled = if fence.is_signaled() {
            true
        } else {
            self.wait_for_fence(&mut fence, timeout_in_nanoseconds)?
        };
        self.release_fence(fence)?;
        Ok(signaled)
    }

    pub fn num_used_fences(&self) -> usize {
        self.lock_state().used_fences.len()
    }

    pub fn num_free_fences(&self) -> usize {
        self.lock_state().free_fences.len()
    }

    /// Released fences which have not been seen signaled yet.
    pub fn num_awaiting_fences(&self) -> usize {
        self.lock_state().awaiting_signal.len()
    }

    /// Reset a signaled fence and pool it, or destroy it when reuse is off.
    fn recycle(
        &self,
        state: &mut FenceManagerState,
        raw: vk::Fence,
    ) -> Result<(), MemoryError> {
        if !self.reuse_fences {
            unsafe { self.device.destroy_fence(raw) };
            return Ok(());
        }
        if let Err(err) = self.device.reset_fence(raw) {
            unsafe { self.device.destroy_fence(raw) };
            return Err(MemoryError::UnexpectedFenceResetError(err));
        }
        state.free_fences.push(raw);
        Ok(())
    }

    /// Move released fences which have signaled since into the pool.
    fn recycle_signaled_fences(&self, state: &mut FenceManagerState) {
        let awaiting = std::mem::take(&mut state.awaiting_signal);
        for raw in awaiting {
            match self.device.get_fence_status(raw) {
                Ok(false) => state.awaiting_signal.push(raw),
                Ok(true) => {
                    if let Err(err) = self.recycle(state, raw) {
                        log::warn!("Dropped fence {:?}: {}", raw, err);
                    }
                }
                Err(err) => {
                    log::warn!(
                        "Unable to query fence {:?}, destroying it: {}",
                        raw,
                        err
                    );
                    unsafe { self.device.destroy_fence(raw) };
                }
            }
        }
    }

    fn check_owned(&self, fence: &Fence) -> Result<(), MemoryError> {
        if self.lock_state().used_fences.contains(&fence.raw) {
            Ok(())
        } else {
            Err(MemoryError::FenceNotOwnedByManager(fence.raw))
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FenceManagerState> {
        self.state
            .lock()
            .expect("unable to acquire the fence manager lock")
    }
}

impl Drop for FenceManager {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.used_fences.is_empty() {
            log::error!(
                "{} fences are still in use at shutdown!",
                state.used_fences.len()
            );
        }
        // The device is expected to be idle by now.
        let fences = state
            .free_fences
            .drain(..)
            .chain(state.awaiting_signal.drain(..));
        for raw in fences {
            unsafe { self.device.destroy_fence(raw) };
        }
    }
}
