//! Launches a process tree inside fresh namespaces with a cgroup tree that
//! matches what the payload expects.
pub mod barrier;
pub mod capabilities;
pub mod cgroup;
pub mod channel;
pub mod error;
pub mod process;
pub mod syscall;
pub mod user_ns;

#[cfg(test)]
mod test_utils;

pub use error::LaunchError;
pub use process::{launch, ExitOutcome, SpawnRequest};
