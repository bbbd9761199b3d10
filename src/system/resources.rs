//! System resources
//!
//! Hardware parallelism available for decoding.

/// Logical CPUs visible to this process, at least 1
pub fn hardware_threads() -> usize {
    num_cpus::get().max(1)
}
