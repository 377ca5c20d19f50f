//! Concurrency primitives shared by the pipeline workers.
//!
//! Every long running task holds a [`shutdown::ShutdownRx`] and selects on it next to its main
//! work so a single signal stops readers, flush loops and export workers alike.

pub mod shutdown;
