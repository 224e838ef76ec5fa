//! Host-facing abstractions the coordinator is generic over.

mod process;

pub use process::{ChildController, ManagedProcess};
