use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;

/// Size of the payload carried by every non-final DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram we expect to receive: opcode, block number and a full block.
const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the transmission mode requested for a transfer. The mode is sent to the server
/// as-is; this client never converts file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMode {
    NetAscii,
    #[default]
    Octet,
    Mail,
}

impl FileMode {
    /// The token written on the wire for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileMode {
    type Err = SocketError;

    fn from_str(raw_mode: &str) -> TftpResult<FileMode> {
        match raw_mode.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'"))),
        }
    }
}

/// The error codes defined by RFC 1350. Servers may send other values; those map to
/// `Undefined` here while the raw number stays available on the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl From<u16> for ErrorCode {
    fn from(raw_err: u16) -> Self {
        match raw_err {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet. The code is kept exactly as the peer sent it.
    Error {
        code: u16,
        message: String,
    },
}

/// Utility enum for the TFTP OpCode at the start of every packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode { Rrq = 1, Wrq = 2, Data = 3, Ack = 4, Error = 5 }

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    Ok((path, raw_mode.parse()?))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data packet carries {} bytes, at most {DATA_BUFFER_SIZE} are allowed",
            buf.len() - 4
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return Err(SocketError::PacketParse(format!("Ack packet must be 4 bytes long, got {}", buf.len())));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = u16_from_buffer(&buf[2..4]);

    // The terminating NUL is optional in practice, only strip it when it is there.
    let raw_message = match &buf[4..] {
        [rest @ .., 0x00] => rest,
        rest => rest,
    };
    let message = String::from_utf8_lossy(raw_message).into_owned();
    Ok(Packet::Error { code, message })
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet into its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                push_cstr(&mut buf, path);
                push_cstr(&mut buf, mode.as_str());
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.to_be_bytes());
                push_cstr(&mut buf, message);
            }
        }
        buf
    }

    /// Decodes any of the five TFTP packet kinds.
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Decodes a packet a server may legitimately send to an uploading client, i.e. an Ack or an
    /// Error. Anything else, including well-formed packets of other kinds, yields `None`.
    pub fn decode_inbound(buf: &[u8]) -> Option<Packet> {
        match Packet::parse_from_buf(buf) {
            Ok(packet @ (Packet::Ack { .. } | Packet::Error { .. })) => Some(packet),
            Ok(packet) => {
                log::debug!("Dropping unsupported inbound {:?} packet", packet.opcode());
                None
            }
            Err(e) => {
                log::debug!("Dropping undecodable datagram: {e}");
                None
            }
        }
    }
}

/// Receive filter for an upload: once a peer is bound only its datagrams are considered, and only
/// those decoding to a packet the client understands are accepted.
pub fn filter_inbound(buf: &[u8], src: SocketAddr, peer: Option<SocketAddr>) -> Option<Packet> {
    if let Some(peer) = peer {
        if src != peer {
            log::debug!("Ignoring datagram from {src}, transfer is bound to {peer}");
            return None;
        }
    }
    Packet::decode_inbound(buf)
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.serialize();
        let written = self.sock.send_to(&buf, dst).await?;
        if written != buf.len() {
            return Err(SocketError::IO(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Only {written} of {} bytes were sent", buf.len()),
            )));
        }
        Ok(())
    }

    /// Waits for the next datagram that passes `filter_inbound`. Everything else is dropped.
    pub async fn recv_filtered(&self, peer: Option<SocketAddr>) -> TftpResult<(Packet, SocketAddr)> {
        // One spare byte so oversized datagrams are not silently truncated into valid ones.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        loop {
            let (total_written, src) = self.sock.recv_from(&mut buf).await?;
            if let Some(packet) = filter_inbound(&buf[..total_written], src, peer) {
                return Ok((packet, src));
            }
        }
    }
}
