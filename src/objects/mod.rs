//! The destructible GPU object model.
//!
//! Any native object which may still be referenced by an in flight submission is wrapped in a
//! [`Destructible`]. Destruction is legal only once its reference count has dropped to zero and
//! the last submission referencing it has retired. Ownership relationships between objects
//! (a pipeline owning its descriptor set layouts, a framebuffer owning its attachment views) are
//! counted edges held by the cache entries in [`crate::renderer::cache`], never raw back
//! pointers.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ash::vk;
use parking_lot::Mutex;

use crate::define_uuid_type;
use crate::device::backend::GpuBackend;

define_uuid_type!(pub, ObjectId);

/// The native payload of a [`Destructible`] with its kind specific destroy logic.
pub enum ObjectKind {
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Pipeline(vk::Pipeline),
    DescriptorSet(vk::DescriptorSet),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    /// A decoded host side object with no native handle. Dropped on destruction.
    Host(Box<dyn Any + Send>),
}

impl ObjectKind {
    pub(crate) fn destroy(self, backend: &dyn GpuBackend) {
        match self {
            ObjectKind::Buffer(buffer) => backend.destroy_buffer(buffer),
            ObjectKind::Memory(memory) => backend.free_memory(memory),
            ObjectKind::Image(image) => backend.destroy_image(image),
            ObjectKind::ImageView(view) => backend.destroy_image_view(view),
            ObjectKind::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
            ObjectKind::DescriptorSet(set) => backend.free_descriptor_set(set),
            ObjectKind::Framebuffer(framebuffer) => backend.destroy_framebuffer(framebuffer),
            ObjectKind::RenderPass(render_pass) => backend.destroy_render_pass(render_pass),
            ObjectKind::Host(object) => drop(object),
        }
    }
}

/// A reference counted native object tracking the last submission that used it.
pub struct Destructible {
    id: ObjectId,
    kind: Mutex<Option<ObjectKind>>,
    ref_count: AtomicU32,
    last_submission: AtomicU64,
}

impl Destructible {
    pub fn new(kind: ObjectKind) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::new(),
            kind: Mutex::new(Some(kind)),
            ref_count: AtomicU32::new(0),
            last_submission: AtomicU64::new(0),
        })
    }

    pub fn get_id(&self) -> ObjectId {
        self.id
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference and returns the remaining count.
    pub fn release_ref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            log::error!("Reference count underflow on {:?}", self.id);
            panic!()
        }
        prev - 1
    }

    pub fn get_ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Marks the object as referenced by submission `id`. The stored value only ever grows.
    pub fn flag_for_submission(&self, id: u64) {
        loop {
            let val = self.last_submission.load(Ordering::Acquire);
            if val >= id {
                return;
            }
            if self.last_submission.compare_exchange(val, id, Ordering::SeqCst, Ordering::Acquire).is_ok() {
                return;
            }
        }
    }

    pub fn get_last_submission(&self) -> u64 {
        self.last_submission.load(Ordering::Acquire)
    }

    /// Pure destroyability predicate. Must be re evaluated on every retirement because
    /// `retired_id` advances asynchronously.
    pub fn can_destroy(&self, retired_id: u64) -> bool {
        if self.ref_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        retired_id >= self.last_submission.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.kind.lock().is_none()
    }

    /// Physically destroys the native payload. May only be called once [`Self::can_destroy`]
    /// returned true.
    pub(crate) fn destroy(&self, backend: &dyn GpuBackend) {
        let kind = self.kind.lock().take();
        match kind {
            Some(kind) => kind.destroy(backend),
            None => log::warn!("Destructible {:?} destroyed twice", self.id),
        }
    }
}

impl Drop for Destructible {
    fn drop(&mut self) {
        if self.kind.get_mut().is_some() {
            log::warn!("Destructible {:?} dropped without being destroyed. Native handle leaked!", self.id);
        }
    }
}

assert_impl_all!(Destructible: Send, Sync);

#[cfg(test)]
mod test {
    use ash::vk::Handle;

    use super::*;
    use crate::test::MockBackend;

    fn dummy_buffer(raw: u64) -> ObjectKind {
        ObjectKind::Buffer(ash::vk::Buffer::from_raw(raw))
    }

    #[test]
    fn can_destroy_requires_zero_refs_and_retirement() {
        let object = Destructible::new(dummy_buffer(0x10));
        object.flag_for_submission(10);

        object.add_ref();
        assert!(!object.can_destroy(10));

        assert_eq!(object.release_ref(), 0);
        assert!(!object.can_destroy(9));
        assert!(object.can_destroy(10));
        assert!(object.can_destroy(11));
    }

    #[test]
    fn last_submission_is_monotonic() {
        let object = Destructible::new(dummy_buffer(0x10));
        object.flag_for_submission(5);
        object.flag_for_submission(3);
        assert_eq!(object.get_last_submission(), 5);
        object.flag_for_submission(8);
        assert_eq!(object.get_last_submission(), 8);
    }

    #[test]
    fn host_objects_drop_on_destroy() {
        let backend = MockBackend::new();

        let payload = Arc::new(0u32);
        let witness = payload.clone();
        let object = Destructible::new(ObjectKind::Host(Box::new(payload)));
        assert_eq!(Arc::strong_count(&witness), 2);

        object.destroy(backend.as_ref());
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn destroy_dispatches_by_kind() {
        let backend = MockBackend::new();

        let buffer = ash::vk::Buffer::from_raw(0x20);
        let object = Destructible::new(ObjectKind::Buffer(buffer));
        object.destroy(backend.as_ref());

        assert!(object.is_destroyed());
        assert_eq!(backend.destroyed_buffers(), vec![buffer]);
    }
}
