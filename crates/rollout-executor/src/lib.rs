//! Process and container backends for rollout.
//!
//! - [`CommandCheck`]: gate checks run as shell commands
//! - [`DockerBuilder`] / [`DigestBuilder`]: image builders
//! - [`DockerRegistry`] / [`MemoryRegistry`]: artifact registries

pub mod build;
pub mod gate;
pub mod memory;
pub mod registry;

pub use build::{DigestBuilder, DockerBuilder};
pub use gate::CommandCheck;
pub use memory::MemoryRegistry;
pub use registry::DockerRegistry;

/// Keep at most the last `lines` lines of command output.
pub(crate) fn output_tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
