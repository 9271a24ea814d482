pub mod allocator;
pub mod capacity;
pub mod packing;
pub mod reconciler;
pub mod resource_state;

mod integration_test;
