//! Host system information

pub mod resources;

pub use resources::hardware_threads;
