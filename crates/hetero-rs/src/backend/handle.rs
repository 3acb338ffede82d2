use std::fmt;

use crate::buffer::GraphTensors;
use crate::device::Device;
use crate::error::BackendResult;
use crate::graph::Graph;

/// Execution context bound to one device, implemented once per backend family.
pub trait Backend: Send {
    /// Human-readable backend identifier (e.g. "CPU", "CUDA0").
    fn name(&self) -> &str;

    fn device(&self) -> &Device;

    /// Family tag the backend belongs to.
    fn family(&self) -> &str {
        self.device().family()
    }

    /// Runs every node of `graph` in order. Returns once the results are visible in `tensors`.
    fn submit(&mut self, graph: &Graph, tensors: &mut GraphTensors) -> BackendResult<()>;

    /// Waits for outstanding device work.
    fn synchronize(&mut self) -> BackendResult<()> {
        Ok(())
    }

    /// Frees per-handle resources. Called exactly once by [`BackendHandle`].
    fn release(&mut self) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Ready,
    Released,
}

/// Owned handle to an initialised backend.
///
/// Handles are only constructed in the `Ready` state. [`BackendHandle::release`] consumes the
/// handle, so submitting to or releasing a handle twice does not compile; a handle that is simply
/// dropped is released on the way out.
pub struct BackendHandle {
    backend: Box<dyn Backend>,
    state: HandleState,
}

impl BackendHandle {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        tracing::debug!(backend = backend.name(), device = %backend.device(), "backend ready");
        Self {
            backend,
            state: HandleState::Ready,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn device(&self) -> &Device {
        self.backend.device()
    }

    pub fn family(&self) -> &str {
        self.backend.family()
    }

    pub fn is_family(&self, family: &str) -> bool {
        self.backend.family() == family
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn submit(&mut self, graph: &Graph, tensors: &mut GraphTensors) -> BackendResult<()> {
        debug_assert_eq!(self.state, HandleState::Ready);
        self.backend.submit(graph, tensors)
    }

    pub fn synchronize(&mut self) -> BackendResult<()> {
        self.backend.synchronize()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn release(mut self) -> BackendResult<()> {
        self.release_backend()
    }

    fn release_backend(&mut self) -> BackendResult<()> {
        self.state = HandleState::Released;
        let result = self.backend.release();
        tracing::debug!(backend = self.backend.name(), ok = result.is_ok(), "backend released");
        result
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if self.state != HandleState::Ready {
            return;
        }
        if let Err(err) = self.release_backend() {
            tracing::warn!(backend = self.backend.name(), "backend release failed: {err}");
        }
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name())
            .field("device", self.device())
            .field("state", &self.state)
            .finish()
    }
}

/// Returns whether `handle` was created by the family tagged `family`.
pub fn backend_is_family(handle: &BackendHandle, family: &str) -> bool {
    handle.is_family(family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        device: Device,
        releases: Arc<AtomicUsize>,
    }

    impl Backend for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn submit(&mut self, _graph: &Graph, _tensors: &mut GraphTensors) -> BackendResult<()> {
            Ok(())
        }

        fn release(&mut self) -> BackendResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handle(releases: &Arc<AtomicUsize>) -> BackendHandle {
        BackendHandle::new(Box::new(Counting {
            device: Device::cpu(),
            releases: Arc::clone(releases),
        }))
    }

    #[test]
    fn explicit_release_does_not_release_again_on_drop() {
        let releases = Arc::new(AtomicUsize::new(0));
        handle(&releases).release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_a_ready_handle_releases_it() {
        let releases = Arc::new(AtomicUsize::new(0));
        let h = handle(&releases);
        assert!(backend_is_family(&h, "cpu"));
        assert!(!h.is_family("cuda"));
        drop(h);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
