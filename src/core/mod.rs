//! Runtime of the `tether` binary.

pub mod probe;
