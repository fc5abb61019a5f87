pub mod backend;
pub mod vulkan;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::prelude::*;

use backend::GpuBackend;

/// Owner of everything the engine needs from the native device.
///
/// This is an explicit context object. It is constructed with a [`GpuBackend`] after the native
/// device has been created and must be dropped before the native device is destroyed. There is
/// deliberately no global instance.
pub struct DeviceContext {
    id: UUID,
    backend: Arc<dyn GpuBackend>,
}

impl DeviceContext {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Arc<Self> {
        Arc::new(Self {
            id: UUID::new(),
            backend,
        })
    }

    pub fn get_uuid(&self) -> UUID {
        self.id
    }

    pub fn get_backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }
}

impl PartialEq for DeviceContext {
    fn eq(&self, other: &Self) -> bool {
        self.id.eq(&other.id)
    }
}

impl Eq for DeviceContext {
}

impl PartialOrd for DeviceContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.id.partial_cmp(&other.id)
    }
}

impl Ord for DeviceContext {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

assert_impl_all!(DeviceContext: Send, Sync);
