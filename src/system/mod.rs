//! Pipeline coordination: shared state, the mapping worker, and the
//! top-level [`FullSystem`](full_system::FullSystem).

pub mod distance_map;
pub mod full_system;
pub mod mapper;
pub mod messages;
pub mod shared;

pub use full_system::FullSystem;
pub use shared::SharedState;
