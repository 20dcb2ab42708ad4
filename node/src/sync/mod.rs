//! Block synchronization.

pub mod puller;
