//! Local file storage hand-off
//!
//! Handles:
//! - Download descriptors for avatars and attachments
//! - The non-blocking queue to the download coordinator

mod downloads;

pub use downloads::{ChannelDownloadQueue, DownloadDescriptor, DownloadQueue};

#[cfg(test)]
pub use downloads::MockDownloadQueue;
