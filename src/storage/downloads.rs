//! Download hand-off
//!
//! The engine records avatar and attachment rows in the store and hands
//! fetchable ones to the download coordinator through a bounded queue.
//! Enqueueing never waits; a full queue leaves the row `absent` for a
//! later pass over pending downloads.

use tokio::sync::mpsc;

use crate::data::{ContentKind, Download, DownloadKind};
use crate::metrics::DOWNLOADS_ENQUEUED_TOTAL;

/// What the coordinator needs to fetch one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDescriptor {
    /// Row id in `downloads`
    pub download_id: i64,
    pub download_kind: DownloadKind,
    pub user_id: Option<i64>,
    pub message_id: Option<i64>,
    pub content_kind: ContentKind,
    pub url: String,
}

impl DownloadDescriptor {
    pub fn avatar(download: &Download) -> Self {
        Self {
            download_id: download.id,
            download_kind: DownloadKind::Avatar,
            user_id: download.user_id,
            message_id: None,
            content_kind: ContentKind::Image,
            url: download.url.clone(),
        }
    }

    pub fn attachment(download: &Download, content_kind: ContentKind) -> Self {
        Self {
            download_id: download.id,
            download_kind: DownloadKind::Attachment,
            user_id: None,
            message_id: download.message_id,
            content_kind,
            url: download.url.clone(),
        }
    }
}

/// Fire-and-forget sink for download descriptors
#[cfg_attr(test, mockall::automock)]
pub trait DownloadQueue: Send + Sync {
    /// Offer a descriptor without waiting
    ///
    /// # Returns
    /// false when the coordinator did not take it
    fn enqueue(&self, descriptor: DownloadDescriptor) -> bool;
}

/// Bounded tokio channel in front of the coordinator
#[derive(Clone)]
pub struct ChannelDownloadQueue {
    tx: mpsc::Sender<DownloadDescriptor>,
}

impl ChannelDownloadQueue {
    /// Create the queue and the receiving end for the coordinator
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DownloadDescriptor>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DownloadQueue for ChannelDownloadQueue {
    fn enqueue(&self, descriptor: DownloadDescriptor) -> bool {
        let kind = descriptor.download_kind.as_str();
        match self.tx.try_send(descriptor) {
            Ok(()) => {
                DOWNLOADS_ENQUEUED_TOTAL
                    .with_label_values(&[kind, "queued"])
                    .inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(descriptor)) => {
                tracing::warn!(
                    download_id = descriptor.download_id,
                    url = %descriptor.url,
                    "Download queue full; left for a later pass"
                );
                DOWNLOADS_ENQUEUED_TOTAL
                    .with_label_values(&[kind, "full"])
                    .inc();
                false
            }
            Err(mpsc::error::TrySendError::Closed(descriptor)) => {
                tracing::debug!(
                    download_id = descriptor.download_id,
                    "Download coordinator gone; descriptor dropped"
                );
                DOWNLOADS_ENQUEUED_TOTAL
                    .with_label_values(&[kind, "closed"])
                    .inc();
                false
            }
        }
    }
}
