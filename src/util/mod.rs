pub mod alloc;
pub mod id;
