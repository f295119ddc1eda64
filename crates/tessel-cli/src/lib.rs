//! Tessel CLI library - shared functionality for testing and binary.

pub mod grad;
pub mod inspect;
