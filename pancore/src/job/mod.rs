//! Job chain construction.
mod chain;
mod dispatch;
mod draw;

pub use self::{
    chain::{JobChain, JobSummary},
    dispatch::{
        tls_size_per_thread, tls_total_size, wls_instance_size, wls_instances, wls_total_size,
        Dispatch,
    },
    draw::{index_min_max, Draw, DrawIndexed},
};
pub(crate) use self::{
    dispatch::compute_payload,
    draw::{tiler_payload, vertex_payload, BatchDescriptors, DrawInfo, Varyings},
};
