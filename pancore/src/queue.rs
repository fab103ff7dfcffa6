use crate::{
    batch::{Batch, EventOpKind},
    command_buffer::{CommandBuffer, CommandBufferStatus},
    config::DebugFlags,
    device::Device,
    Error,
};
use pankmod::{BoHandle, JobRequirements, JobSubmit, KernelDevice, SyncHandle};
use std::{fmt, sync::Arc};
use tracing::{debug, error, trace_span};

/// Submits batches to the kernel, in order.
///
/// Every submission signals the queue's sync object. Consecutive batches are ordered through
/// it: the fragment job of a batch waits on the chain of the same batch, and the kernel runs
/// the submissions of a queue in the order they were made.
pub struct Queue {
    device: Arc<Device>,
    sync: SyncHandle,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>) -> Result<Queue, Error> {
        let sync = device.kernel().syncobj_create(true)?;
        Ok(Queue { device, sync })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Sync object signalled when the last submission completes.
    pub fn sync(&self) -> SyncHandle {
        self.sync
    }

    /// Submits every batch of `command_buffers`.
    ///
    /// Nothing reaches the kernel if any command buffer is not executable or holds a batch
    /// that was already issued.
    pub fn submit(&self, command_buffers: &mut [&mut CommandBuffer]) -> Result<(), Error> {
        let _span = trace_span!("queue_submit", count = command_buffers.len()).entered();
        for cb in command_buffers.iter() {
            if cb.status() != CommandBufferStatus::Executable {
                return Err(Error::invalid_usage(format!(
                    "submitted command buffer is {:?}",
                    cb.status()
                )));
            }
            if cb.batches().iter().any(Batch::is_issued) {
                return Err(Error::AlreadyIssued);
            }
        }

        for cb in command_buffers.iter_mut() {
            let mut bos = cb.pool_bos();
            bos.extend(self.device.bos());
            for i in 0..cb.batches().len() {
                self.submit_batch(&cb.batches()[i], &bos)?;
                cb.batches_mut()[i].issued = true;
            }
            self.dump(cb);
        }
        Ok(())
    }

    fn submit_batch(&self, batch: &Batch, common_bos: &[BoHandle]) -> Result<(), Error> {
        let kernel = self.device.kernel();
        let debug_flags = self.device.config().debug;

        let mut bos: Vec<BoHandle> = common_bos.iter().chain(batch.bos()).copied().collect();
        bos.sort();
        bos.dedup();
        let waits: Vec<SyncHandle> = batch
            .event_ops()
            .iter()
            .filter(|op| op.kind == EventOpKind::Wait)
            .map(|op| op.event.sync())
            .collect();

        if let Some(head) = batch.head() {
            debug!("submitting chain {:#x} ({} jobs)", head, batch.jobs().len());
            kernel.submit(&JobSubmit {
                head,
                requirements: JobRequirements::empty(),
                bos: &bos,
                in_syncs: &waits,
                out_sync: Some(self.sync),
            })?;
        }
        if let Some(fragment) = batch.fragment_job() {
            debug!("submitting fragment job {:#x}", fragment);
            let chain_sync = [self.sync];
            let in_syncs: &[SyncHandle] = if batch.head().is_some() {
                &chain_sync
            } else {
                &waits
            };
            kernel.submit(&JobSubmit {
                head: fragment,
                requirements: JobRequirements::FRAGMENT,
                bos: &bos,
                in_syncs,
                out_sync: Some(self.sync),
            })?;
        }

        if debug_flags.intersects(DebugFlags::SYNC | DebugFlags::TRACE) {
            kernel.syncobj_wait(self.sync, u64::MAX)?;
        }
        if debug_flags.contains(DebugFlags::TRACE) {
            if let Some(capture) = self.device.allocator().capture() {
                if let Some(head) = batch.head() {
                    capture.record_chain(head, false);
                }
                if let Some(fragment) = batch.fragment_job() {
                    capture.record_chain(fragment, true);
                }
            }
        }

        for op in batch.event_ops() {
            match op.kind {
                EventOpKind::Set => kernel.syncobj_transfer(op.event.sync(), self.sync)?,
                EventOpKind::Reset => kernel.syncobj_reset(op.event.sync())?,
                EventOpKind::Wait => {}
            }
        }
        Ok(())
    }

    /// Writes the capture context and the command buffer's descriptors to disk.
    fn dump(&self, cb: &CommandBuffer) {
        let config = self.device.config();
        if !config.debug.contains(DebugFlags::DUMP) {
            return;
        }
        let capture = match self.device.allocator().capture() {
            Some(capture) => capture,
            None => return,
        };
        for (va, contents) in cb.pool_contents() {
            capture.snapshot(va, contents);
        }
        if let Err(err) = capture.dump(&config.dump_path) {
            error!("failed to write {}: {}", config.dump_path.display(), err);
        }
    }

    /// Waits until every submission made so far has completed.
    pub fn wait_idle(&self) -> Result<(), Error> {
        Ok(self.device.kernel().syncobj_wait(self.sync, u64::MAX)?)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let kernel: &Arc<dyn KernelDevice> = self.device.kernel();
        kernel.syncobj_destroy(self.sync);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Queue({:?})", self.sync)
    }
}
