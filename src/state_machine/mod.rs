// Task lifecycle states shared by the status store, the correlator, and
// result subscribers. The broker core does not persist transitions; the
// transport-managed queues are the only durable state.

pub mod states;

// Re-export main types for convenient access
pub use states::TaskStatus;
