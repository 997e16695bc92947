use ash::vk;

/// Fences only ever move from NotReady to Signaled until they are released
/// back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    NotReady,
    Signaled,
}

/// A fence owned by the caller until it is handed back to the
/// [FenceManager](super::FenceManager).
///
/// The state is a cache of the device's answer so a fence which has been seen
/// signaled is never polled again.
#[derive(Debug)]
pub struct Fence {
    pub(super) raw: vk::Fence,
    pub(super) state: FenceState,
}

impl Fence {
    pub(super) fn new(raw: vk::Fence) -> Self {
        Self {
            raw,
            state: FenceState::NotReady,
        }
    }

    /// The raw fence handle, for use in queue submissions.
    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// The cached state. Use the manager to ask the device.
    pub fn is_signaled(&self) -> bool {
        self.state == FenceState::Signaled
    }

    pub(super) fn mark_signaled(&mut self) {
        self.state = FenceState::Signaled;
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.raw != vk::Fence::null() {
            log::error!(
                "Fence {:?} was dropped without being released to the fence \
                 manager!",
                self.raw
            );
        }
    }
}
