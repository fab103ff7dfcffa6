use crate::Error;
use pankmod::{KernelDevice, SyncHandle};
use std::{fmt, sync::Arc};

/// An event backed by a kernel sync object.
///
/// Signalled events have a signalled sync object. Command buffers set, reset and wait on
/// events at batch boundaries; the host can do the same directly.
pub struct Event {
    kernel: Arc<dyn KernelDevice>,
    sync: SyncHandle,
}

impl Event {
    pub(crate) fn new(kernel: Arc<dyn KernelDevice>) -> Result<Event, Error> {
        let sync = kernel.syncobj_create(false)?;
        Ok(Event { kernel, sync })
    }

    pub fn sync(&self) -> SyncHandle {
        self.sync
    }

    pub fn is_set(&self) -> bool {
        self.kernel.syncobj_wait(self.sync, 0).is_ok()
    }

    pub fn reset(&self) -> Result<(), Error> {
        Ok(self.kernel.syncobj_reset(self.sync)?)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.kernel.syncobj_destroy(self.sync);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Event({:?})", self.sync)
    }
}
