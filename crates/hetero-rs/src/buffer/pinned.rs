use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::BackendResult;

/// Driver-side half of an external host registration.
pub trait HostPinning: Send + Sync {
    /// Removes the driver mapping of the region starting at `addr`.
    fn unpin(&self, addr: usize, len: usize) -> BackendResult<()>;
}

/// Scoped registration of caller-owned host memory with an accelerator driver.
///
/// The guard mutably borrows the registered region, so the region cannot be freed or reused
/// while the driver still maps it. Dropping the guard unregisters; [`HostRegistration::unregister`]
/// does the same but surfaces the driver's answer.
pub struct HostRegistration<'a> {
    region: &'a mut [u8],
    pinning: Arc<dyn HostPinning>,
    active: bool,
}

impl<'a> HostRegistration<'a> {
    /// Wraps a region the driver has already accepted.
    pub fn new(region: &'a mut [u8], pinning: Arc<dyn HostPinning>) -> Self {
        Self {
            region,
            pinning,
            active: true,
        }
    }

    pub fn addr(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn unregister(mut self) -> BackendResult<()> {
        self.active = false;
        self.pinning.unpin(self.addr(), self.len())
    }
}

impl Deref for HostRegistration<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.region
    }
}

impl DerefMut for HostRegistration<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.region
    }
}

impl Drop for HostRegistration<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.pinning.unpin(self.addr(), self.len()) {
            tracing::warn!(
                addr = format_args!("{:#x}", self.addr()),
                len = self.len(),
                "failed to unregister host buffer; driver mapping leaked: {err}"
            );
        }
    }
}

impl fmt::Debug for HostRegistration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistration")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<(usize, usize)>>);

    impl HostPinning for Log {
        fn unpin(&self, addr: usize, len: usize) -> BackendResult<()> {
            self.0.lock().unwrap().push((addr, len));
            Ok(())
        }
    }

    #[test]
    fn drop_and_unregister_each_unpin_once() {
        let log = Arc::new(Log::default());
        let mut region = vec![0u8; 64];
        let addr = region.as_ptr() as usize;

        drop(HostRegistration::new(&mut region, log.clone()));
        HostRegistration::new(&mut region, log.clone())
            .unregister()
            .unwrap();

        assert_eq!(*log.0.lock().unwrap(), vec![(addr, 64), (addr, 64)]);
    }

    #[test]
    fn guard_exposes_region() {
        let log = Arc::new(Log::default());
        let mut region = vec![0u8; 4];
        {
            let mut guard = HostRegistration::new(&mut region, log);
            guard[0] = 7;
            assert_eq!(guard.len(), 4);
        }
        assert_eq!(region[0], 7);
    }
}
