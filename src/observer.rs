use crate::client::UploadError;
use std::path::Path;

/// Lifecycle notifications emitted while a file is uploaded.
///
/// Every method has a no-op default so implementors only override what they care about. All calls
/// are made from the transfer's event loop, one at a time, in protocol order.
pub trait UploadObserver: Send + Sync {
    fn will_send_request(&self) {}
    fn did_send_request(&self) {}
    fn did_receive_request_ack(&self) {}
    fn will_send_data_block(&self, _block: u16) {}
    fn did_send_data_block(&self, _block: u16) {}
    fn will_receive_ack(&self, _block: u16) {}
    fn did_receive_ack(&self, _block: u16) {}
    fn did_fail(&self, _error: &UploadError) {}
    fn did_complete(&self, _path: &Path, _name: &str) {}

    /// Bytes that will have been delivered once the block about to be sent is acknowledged.
    fn will_send_bytes(&self, _sent: u64, _total: u64) {}

    /// Bytes the server has acknowledged so far.
    fn did_send_bytes(&self, _sent: u64, _total: u64) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Observer that reports the transfer through the `log` facade.
#[derive(Debug, Default)]
pub struct LogObserver;

impl UploadObserver for LogObserver {
    fn will_send_request(&self) {
        log::debug!("Sending write request");
    }

    fn did_send_request(&self) {
        log::debug!("Write request sent");
    }

    fn did_receive_request_ack(&self) {
        log::info!("Server accepted the write request");
    }

    fn will_send_data_block(&self, block: u16) {
        log::trace!("Sending block {block}");
    }

    fn did_send_data_block(&self, block: u16) {
        log::trace!("Block {block} sent");
    }

    fn did_receive_ack(&self, block: u16) {
        log::trace!("Block {block} acknowledged");
    }

    fn did_fail(&self, error: &UploadError) {
        log::error!("Upload failed: {error}");
    }

    fn did_complete(&self, path: &Path, name: &str) {
        log::info!("Uploaded {} as '{name}'", path.display());
    }

    fn did_send_bytes(&self, sent: u64, total: u64) {
        log::debug!("{sent}/{total} bytes acknowledged");
    }
}
