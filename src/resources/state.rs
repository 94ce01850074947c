//! Per-resource state tracking

use crate::backend::{BarrierResource, GraphicsBackend, ResourceBarrier};
use thiserror::Error;

pub use crate::backend::ResourceState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{resource:?} expected in {expected:?} but tracked in {actual:?}")]
    Mismatch {
        resource: BarrierResource,
        expected: ResourceState,
        actual: ResourceState,
    },
}

/// Current access state of one GPU resource.
///
/// Every transition states which state the caller believes the resource is
/// in. A wrong belief is reported instead of recording a barrier from the
/// wrong source state.
#[derive(Debug, Clone)]
pub struct TrackedState {
    resource: BarrierResource,
    current: ResourceState,
}

impl TrackedState {
    pub fn new(resource: BarrierResource, initial: ResourceState) -> Self {
        Self {
            resource,
            current: initial,
        }
    }

    pub fn current(&self) -> ResourceState {
        self.current
    }

    pub fn resource(&self) -> BarrierResource {
        self.resource
    }

    /// Move from `expected` to `next`, recording a barrier.
    ///
    /// Returns whether a barrier was recorded; `expected == next` records nothing.
    pub fn transition<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        expected: ResourceState,
        next: ResourceState,
    ) -> Result<bool, StateError> {
        if self.current != expected {
            return Err(StateError::Mismatch {
                resource: self.resource,
                expected,
                actual: self.current,
            });
        }
        if expected == next {
            return Ok(false);
        }
        backend.resource_barrier(&[ResourceBarrier {
            resource: self.resource,
            before: expected,
            after: next,
        }]);
        self.current = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BufferDescriptor, BufferUsage, HeadlessBackend, MemoryLocation,
    };

    fn tracked(backend: &mut HeadlessBackend, initial: ResourceState) -> TrackedState {
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::STORAGE | BufferUsage::STORAGE_WRITE,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        TrackedState::new(BarrierResource::Buffer(buffer), initial)
    }

    #[test]
    fn transition_records_one_barrier() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut state = tracked(&mut backend, ResourceState::CopyDest);

        let recorded = state
            .transition(&mut backend, ResourceState::CopyDest, ResourceState::ShaderResource)
            .unwrap();

        assert!(recorded);
        assert_eq!(state.current(), ResourceState::ShaderResource);
        assert_eq!(
            backend.barrier_log(),
            &[ResourceBarrier {
                resource: state.resource(),
                before: ResourceState::CopyDest,
                after: ResourceState::ShaderResource,
            }]
        );
    }

    #[test]
    fn mismatched_expectation_is_caught() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut state = tracked(&mut backend, ResourceState::ShaderResource);

        // A UAV write after an SRV read without the intermediate transition
        let err = state
            .transition(
                &mut backend,
                ResourceState::UnorderedAccess,
                ResourceState::ShaderResource,
            )
            .unwrap_err();

        assert_eq!(
            err,
            StateError::Mismatch {
                resource: state.resource(),
                expected: ResourceState::UnorderedAccess,
                actual: ResourceState::ShaderResource,
            }
        );
        assert_eq!(state.current(), ResourceState::ShaderResource);
        assert!(backend.barrier_log().is_empty());
    }

    #[test]
    fn same_state_transition_is_elided() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut state = tracked(&mut backend, ResourceState::RenderTarget);
        let recorded = state
            .transition(&mut backend, ResourceState::RenderTarget, ResourceState::RenderTarget)
            .unwrap();
        assert!(!recorded);
        assert!(backend.barrier_log().is_empty());
    }
}
