//! Error types for simdev.

use thiserror::Error;

/// Result type alias using simdev's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring device models.
///
/// These cover setup-time failures only. Runtime faults while walking a
/// virtqueue are reported as [`crate::virtio::VirtioStatus`] values on the
/// message, and GIC programmer errors are logged and absorbed; neither ever
/// surfaces as a Rust error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("virtqueue {0} was not requested by the device")]
    QueueNotRequested(u32),

    #[error("virtqueue {id}: size {size} exceeds device limit {limit}")]
    QueueSizeExceeded { id: u32, size: u32, limit: u32 },

    #[error("virtqueue {0}: guest memory for ring areas not accessible")]
    QueueMemory(u32),

    #[error("config space access out of range: {0:#x}+{1:#x}")]
    ConfigRange(u64, u64),

    #[error("driver requested unsupported features: {0:#018x}")]
    FeaturesRejected(u64),
}
