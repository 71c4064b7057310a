// A TFTP (RFC 1350) upload client.
//
// The client sends a local file to a server with a write request, then pushes the file in
// 512-byte DATA blocks, each of which has to be acknowledged before the next one goes out. A
// block shorter than 512 bytes (possibly empty) ends the transfer.
//
// Packet layouts, all integers big-endian:
//
//   WRQ    0x00 0x02 | Filename | 0x00 | Mode | 0x00
//   DATA   0x00 0x03 | Block # (2 bytes) | Data (0-512 bytes)
//   ACK    0x00 0x04 | Block # (2 bytes)
//   ERROR  0x00 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// The request goes to the server's well-known port (69). The server answers from a port of its
// own choosing, and from then on only packets from that address belong to the transfer.
//
// Lost packets are handled by timeouts: if no acknowledgement arrives in time, the last packet
// is sent again, a bounded number of times. An ERROR packet from the server ends the transfer
// immediately; it is never acknowledged or retransmitted.
//
// Only the upload direction is implemented, and the transfer mode is passed to the server
// without converting the file contents.

pub mod client;
pub mod config;
pub mod observer;
pub mod processor;
pub mod tftp;
pub mod timer;

pub use client::{TftpClient, UploadError, UploadOutcome};
pub use config::ClientConfig;
pub use observer::{LogObserver, NoopObserver, UploadObserver};
pub use tftp::{FileMode, Packet};
