//! Small utilities that do not belong to any one subsystem.

pub mod fixed_point;

pub use fixed_point::Fixed;
