//! Internal utilities: prompt cleanup and geometry alignment.

pub mod geometry;
pub mod prompting;
