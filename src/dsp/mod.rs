//! Signal processing building blocks

pub mod iir;

pub use iir::{IirFilter, Section};
