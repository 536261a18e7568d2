//! The three process launch sequence: the parent forks an outer child that
//! owns the mount namespace, which forks the inner child into the remaining
//! namespaces. Parent and inner child then move in lock-step over a barrier.

pub mod args;
pub mod channel;
pub mod fork;
pub mod inner_child;
pub mod message;
pub mod outer_child;
pub mod parent;
pub mod signals;

pub use args::{ContainerArgs, SpawnRequest};
pub use parent::{exit_outcome, launch, launch_with_registry, ContainerGuard, ExitOutcome};
