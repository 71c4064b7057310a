// The upload engine. It owns the file being sent and every piece of per-transfer protocol state,
// and turns each event (an inbound packet or a retransmission timeout) into a single action for
// the event loop in `client` to carry out. It never touches the network itself.
//
// A transfer moves through these states:
//
//   AwaitingRequestAck --ACK(0)--> AwaitingBlockAck --ACK(n), final block--> Completed
//          |                          |      ^
//          |                          +------+ ACK(n), more data: send block n+1
//          +--------------------------+-------> Failed (ERROR packet, timeout, read failure)
//
// Idle is not a state here: an idle client simply has no processor.

use crate::client::UploadError;
use crate::observer::UploadObserver;
use crate::tftp::{self, ErrorCode, FileMode, Packet};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt};

const BLOCK_SIZE: u64 = tftp::DATA_BUFFER_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// The write request is out, waiting for the server's ACK(0).
    AwaitingRequestAck,
    /// A data block is out, waiting for its ACK.
    AwaitingBlockAck,
    Completed,
    Failed,
}

/// Represents an action that the caller of UploadProcessor should take in
/// response to processing an event.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet to the current destination and (re)arm the retransmission
    /// timer.
    SendPacketAndAwait(Packet),

    /// Caller should keep waiting without touching the timer.
    RetryRecv,

    /// The last block was acknowledged, the transfer is done.
    Complete,

    /// The transfer is over and failed.
    Fail(UploadError),
}

#[derive(Debug)]
pub struct UploadProcessor {
    f: File,
    path: PathBuf,
    name: String,
    mode: FileMode,
    file_size: u64,

    /// Where the next read on `f` starts.
    position: u64,

    state: UploadState,

    /// The last block sent. 0 while the write request is outstanding.
    curr_block: u16,

    /// File offset of `curr_block`'s payload.
    curr_offset: u64,

    /// Bytes delivered once `curr_block` is acknowledged.
    sent_bytes: u64,

    final_block_sent: bool,

    /// The server's transfer address, learned from its ACK(0).
    peer: Option<SocketAddr>,

    retries: usize,
    max_retries: usize,
}

impl UploadProcessor {
    /// Opens `path` for upload under `name`. Fails with `FileUnreadable` if the file cannot be
    /// opened or is not a regular file.
    pub async fn open(
        path: &Path,
        name: &str,
        mode: FileMode,
        max_retries: usize,
    ) -> Result<UploadProcessor, UploadError> {
        let f = File::open(path).await.map_err(UploadError::FileUnreadable)?;
        let metadata = f.metadata().await.map_err(UploadError::FileUnreadable)?;
        if !metadata.is_file() {
            return Err(UploadError::FileUnreadable(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        log::info!("Uploading {:#?} ({} bytes) as '{}'", path, metadata.len(), name);
        Ok(UploadProcessor {
            f,
            path: path.to_path_buf(),
            name: name.to_string(),
            mode,
            file_size: metadata.len(),
            position: 0,
            state: UploadState::AwaitingRequestAck,
            curr_block: 0,
            curr_offset: 0,
            sent_bytes: 0,
            final_block_sent: false,
            peer: None,
            retries: 0,
            max_retries,
        })
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn last_block(&self) -> u16 {
        self.curr_block
    }

    /// Produces the write request that opens the transfer.
    pub fn first_packet(&mut self, observer: &dyn UploadObserver) -> ResultAction {
        self.state = UploadState::AwaitingRequestAck;
        self.curr_block = 0;
        observer.will_send_request();
        ResultAction::SendPacketAndAwait(Packet::WriteReq {
            path: self.name.clone(),
            mode: self.mode,
        })
    }

    /// The retransmission timer fired: resend the outstanding packet, or give up once the retry
    /// budget is spent.
    pub async fn process_timeout(&mut self, observer: &dyn UploadObserver) -> ResultAction {
        if !self.is_active() {
            return ResultAction::RetryRecv;
        }

        self.retries += 1;
        if self.retries > self.max_retries {
            log::warn!(
                "No answer after {} retransmissions of block {}, giving up",
                self.max_retries,
                self.curr_block
            );
            return self.fail(UploadError::Timeout);
        }

        log::warn!(
            "Timed out waiting for ack {}, retransmitting ({}/{})",
            self.curr_block,
            self.retries,
            self.max_retries
        );
        match self.state {
            UploadState::AwaitingRequestAck => self.first_packet(observer),
            _ => self.send_block(self.curr_block, self.curr_offset, observer).await,
        }
    }

    /// Given an inbound packet that passed the receive filter, describes what to do next.
    pub async fn process_packet(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        observer: &dyn UploadObserver,
    ) -> ResultAction {
        match self.state {
            UploadState::AwaitingRequestAck => self.process_request_reply(packet, src, observer).await,
            UploadState::AwaitingBlockAck => self.process_block_reply(packet, observer).await,
            UploadState::Completed | UploadState::Failed => ResultAction::RetryRecv,
        }
    }

    async fn process_request_reply(
        &mut self,
        packet: &Packet,
        src: SocketAddr,
        observer: &dyn UploadObserver,
    ) -> ResultAction {
        match packet {
            &Packet::Ack { block: 0 } => {
                self.retries = 0;
                self.peer = Some(src);
                log::info!("Write request acknowledged by {src}");
                observer.did_receive_request_ack();

                if self.file_size == 0 {
                    self.state = UploadState::Completed;
                    return ResultAction::Complete;
                }
                self.send_block(1, 0, observer).await
            }
            Packet::Ack { block } => {
                // Duplicated or delayed traffic from an earlier transfer.
                log::debug!("Ignoring ack for block {block} while the write request is outstanding");
                ResultAction::RetryRecv
            }
            Packet::Error { code, message } => self.remote_error(*code, message),
            _ => self.fail(UploadError::ProtocolViolation(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.opcode()
            ))),
        }
    }

    async fn process_block_reply(&mut self, packet: &Packet, observer: &dyn UploadObserver) -> ResultAction {
        match packet {
            &Packet::Ack { block } if block == self.curr_block => {
                observer.will_receive_ack(block);
                self.retries = 0;
                observer.did_receive_ack(block);
                observer.did_send_bytes(self.sent_bytes, self.file_size);

                if self.final_block_sent {
                    self.state = UploadState::Completed;
                    return ResultAction::Complete;
                }

                let next = block.wrapping_add(1);
                if next == 0 {
                    log::warn!("Block counter wrapped around, the server must support rollover");
                }
                self.send_block(next, self.curr_offset + BLOCK_SIZE, observer).await
            }
            Packet::Ack { block } => {
                log::debug!("Ignoring ack for block {block}, waiting for {}", self.curr_block);
                ResultAction::RetryRecv
            }
            Packet::Error { code, message } => self.remote_error(*code, message),
            _ => self.fail(UploadError::ProtocolViolation(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.opcode()
            ))),
        }
    }

    /// Reads the block at `offset` and wraps it in a data packet numbered `block`.
    async fn send_block(&mut self, block: u16, offset: u64, observer: &dyn UploadObserver) -> ResultAction {
        let data = match self.read_block(offset).await {
            Ok(data) => data,
            Err(e) => return self.fail(UploadError::FileUnreadable(e)),
        };

        self.state = UploadState::AwaitingBlockAck;
        self.curr_block = block;
        self.curr_offset = offset;
        self.sent_bytes = offset + data.len() as u64;
        if data.len() < tftp::DATA_BUFFER_SIZE {
            self.final_block_sent = true;
        }

        observer.will_send_data_block(block);
        observer.will_send_bytes(self.sent_bytes, self.file_size);
        ResultAction::SendPacketAndAwait(Packet::Data { block, data })
    }

    /// Reads the payload for the block starting at `offset`, which must hold exactly
    /// `min(512, size - offset)` bytes. A zero-length block is therefore only possible right at
    /// the end of a file whose size is a multiple of the block size.
    async fn read_block(&mut self, offset: u64) -> Result<Vec<u8>, io::Error> {
        if self.position != offset {
            self.position = self.f.seek(SeekFrom::Start(offset)).await?;
        }

        let data = read_block_from_file(&mut self.f).await?;
        self.position += data.len() as u64;

        let expected = self.file_size.saturating_sub(offset).min(BLOCK_SIZE);
        if data.len() as u64 != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Failed to read file: expected {expected} bytes at offset {offset}, got {}",
                    data.len()
                ),
            ));
        }
        Ok(data)
    }

    fn remote_error(&mut self, code: u16, message: &str) -> ResultAction {
        log::warn!(
            "Server sent error packet: code: {} ({:?}), message: '{}'",
            code,
            ErrorCode::from(code),
            message
        );
        self.fail(UploadError::RemoteError { code, message: message.to_string() })
    }

    fn fail(&mut self, e: UploadError) -> ResultAction {
        self.state = UploadState::Failed;
        ResultAction::Fail(e)
    }

    fn is_active(&self) -> bool {
        matches!(self.state, UploadState::AwaitingRequestAck | UploadState::AwaitingBlockAck)
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than requested, keep going until the buffer is full
    // or the file ends.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}
