//! CPU/GPU frame synchronization

use crate::backend::{BackendError, GraphicsBackend};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("At least one frame slot is required")]
    NoFrameSlots,
    #[error("Timed out after {timeout:?} waiting for fence value {value}")]
    Timeout { value: u64, timeout: Duration },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Fence bookkeeping for a ring of frame slots.
///
/// The fence counter starts at 1 and is advanced once per signal. Each slot
/// remembers the value signaled after its last submission, and a slot is only
/// handed back once the GPU has reached that value.
#[derive(Debug)]
pub struct FrameSynchronizer {
    next_fence_value: u64,
    slot_fences: Vec<u64>,
    current_slot: usize,
    timeout: Option<Duration>,
}

impl FrameSynchronizer {
    /// `timeout` bounds every blocking wait; `None` waits forever.
    pub fn new(frame_slots: usize, timeout: Option<Duration>) -> Result<Self, SyncError> {
        if frame_slots == 0 {
            return Err(SyncError::NoFrameSlots);
        }
        Ok(Self {
            next_fence_value: 1,
            slot_fences: vec![0; frame_slots],
            current_slot: 0,
            timeout,
        })
    }

    pub fn next_fence_value(&self) -> u64 {
        self.next_fence_value
    }

    /// Last value handed to the GPU, 0 before the first signal
    pub fn last_signaled(&self) -> u64 {
        self.next_fence_value - 1
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frame_slots(&self) -> usize {
        self.slot_fences.len()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Signaled values the GPU has not reached yet
    pub fn in_flight<B: GraphicsBackend>(&self, backend: &mut B) -> u64 {
        self.last_signaled()
            .saturating_sub(backend.completed_fence_value())
    }

    /// Signal the next value and block until the GPU reaches it.
    ///
    /// Returns the value waited on, which covers every submission made before
    /// the call.
    pub fn signal_and_wait_idle<B: GraphicsBackend>(&mut self, backend: &mut B) -> Result<u64, SyncError> {
        let value = self.next_fence_value;
        backend.signal_fence(value)?;
        self.wait_for(backend, value)?;
        self.next_fence_value += 1;
        log::debug!("GPU idle at fence {}", value);
        Ok(value)
    }

    /// Close the current frame and move to the next slot.
    ///
    /// Signals the current value for the slot that was just submitted, then
    /// blocks only if the slot being entered still has work in flight. At most
    /// `frame_slots` frames are ever outstanding.
    pub fn advance_frame<B: GraphicsBackend>(&mut self, backend: &mut B) -> Result<u64, SyncError> {
        let value = self.next_fence_value;
        backend.signal_fence(value)?;
        self.slot_fences[self.current_slot] = value;
        self.next_fence_value += 1;

        self.current_slot = (self.current_slot + 1) % self.slot_fences.len();
        let required = self.slot_fences[self.current_slot];
        if required != 0 && backend.completed_fence_value() < required {
            log::trace!("Slot {} waits for fence {}", self.current_slot, required);
            self.wait_for(backend, required)?;
        }
        Ok(value)
    }

    fn wait_for<B: GraphicsBackend>(&self, backend: &mut B, value: u64) -> Result<(), SyncError> {
        if backend.wait_for_fence(value, self.timeout)? {
            return Ok(());
        }
        match self.timeout {
            Some(timeout) => Err(SyncError::Timeout { value, timeout }),
            None => Err(SyncError::Backend(BackendError::DeviceLost)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use rstest::rstest;

    #[test]
    fn zero_slots_is_rejected() {
        assert!(matches!(
            FrameSynchronizer::new(0, None),
            Err(SyncError::NoFrameSlots)
        ));
    }

    #[test]
    fn wait_idle_reaches_the_signaled_value() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut sync = FrameSynchronizer::new(2, None).unwrap();

        assert_eq!(sync.signal_and_wait_idle(&mut backend).unwrap(), 1);
        assert_eq!(backend.completed_fence_value(), 1);
        assert_eq!(sync.next_fence_value(), 2);
        assert_eq!(sync.in_flight(&mut backend), 0);
    }

    #[rstest]
    #[case::double_buffered(2)]
    #[case::triple_buffered(3)]
    fn in_flight_frames_never_exceed_slots(#[case] slots: usize) {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut sync = FrameSynchronizer::new(slots, None).unwrap();

        for n in 1..=10u64 {
            let signaled = sync.advance_frame(&mut backend).unwrap();
            assert_eq!(signaled, n);
            assert!(sync.in_flight(&mut backend) < slots as u64);
            if n >= slots as u64 {
                assert!(backend.completed_fence_value() >= n + 1 - slots as u64);
            }
        }
        assert_eq!(sync.current_slot(), 10 % slots);
    }

    #[test]
    fn first_frames_do_not_block() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut sync = FrameSynchronizer::new(2, None).unwrap();

        sync.advance_frame(&mut backend).unwrap();
        assert!(backend.fence_waits().is_empty());
        assert_eq!(backend.completed_fence_value(), 0);

        sync.advance_frame(&mut backend).unwrap();
        assert_eq!(backend.fence_waits(), &[1]);
    }

    #[test]
    fn expired_wait_reports_timeout() {
        let mut backend = HeadlessBackend::new(4, 4);
        let timeout = Duration::from_millis(1);
        let sync = FrameSynchronizer::new(2, Some(timeout)).unwrap();

        // Nothing signaled value 5, so the simulated GPU can never reach it.
        let err = sync.wait_for(&mut backend, 5).unwrap_err();
        assert!(matches!(err, SyncError::Timeout { value: 5, .. }));
    }
}
