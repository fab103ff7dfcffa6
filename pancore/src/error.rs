use pankmod::KernelError;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("out of host memory")]
    HostOutOfMemory,
    #[error("out of device memory")]
    DeviceOutOfMemory,
    #[error("out of descriptor pool memory")]
    OutOfPoolMemory,
    #[error("GPU virtual address space exhausted")]
    VaExhausted,
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    #[error("batch has already been issued")]
    AlreadyIssued,
    #[error("unsupported GPU (product id {0:#x})")]
    UnsupportedGpu(u32),
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl Error {
    pub(crate) fn invalid_usage(msg: impl Into<String>) -> Error {
        Error::InvalidUsage(msg.into())
    }

    /// Maps a kernel allocation failure to `DeviceOutOfMemory`, keeping other errors verbatim.
    pub(crate) fn from_alloc(err: KernelError) -> Error {
        if err.is_out_of_memory() {
            Error::DeviceOutOfMemory
        } else {
            Error::Kernel(err)
        }
    }
}
