//! Resource lifetime and command submission synchronization for a Vulkan execution backend.
//!
//! The crate tracks GPU work through monotonically increasing submission ids. Everything that
//! must wait for the GPU, destroying objects, reusing staging memory, reusing command buffers,
//! is expressed as "wait until submission N has retired". See [`renderer::SubmissionEngine`] for
//! the entry point.

#[macro_use]
extern crate static_assertions;

pub mod device;
pub mod objects;
pub mod renderer;
pub mod util;

#[cfg(any(test, feature = "test_utils"))]
pub mod test;

pub mod prelude {
    pub use crate::device::backend::GpuBackend;
    pub use crate::device::DeviceContext;
    pub use crate::util::id::UUID;
}

#[cfg(test)]
pub(crate) fn init_test_env() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(all(feature = "test_utils", not(test)))]
pub(crate) fn init_test_env() {
}
