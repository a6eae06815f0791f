//! Pasternack synthesizer drivers.

pub mod pe11s390;

pub use pe11s390::Pe11s390Driver;
