//! Tracking-side data handed to the optimizer.

pub mod frame;

pub use frame::Frame;
