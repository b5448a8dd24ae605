//! Durable, inspectable run state.

mod store;

pub use store::{RunSnapshot, RunStore};
