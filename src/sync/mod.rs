//! Fences and the submission counters used to gate deferred reclamation.

mod fence;
mod fence_manager;
mod submission;

pub use self::{
    fence::{Fence, FenceState},
    fence_manager::FenceManager,
    submission::{SubmissionTracker, TrackedCommandBuffer},
};
