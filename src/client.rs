// This module contains the client-side upload driver.
//
// An upload is started with `TftpClient::send_file` and runs entirely inside that call:
//
// 1. Open the local file. Nothing touches the network if this fails.
// 2. Resolve the server, bind a socket on a fresh local port (our transfer identifier) and send
//    the write request to the server's well-known port.
// 3. Loop: wait for whichever comes first of an inbound packet, the retransmission timer or a
//    cancellation, hand the event to the `UploadProcessor`, and carry out the action it returns.
//    The server answers from its own transfer port; once its ACK(0) arrives every later datagram
//    has to come from that address or it is dropped by the receive filter.
//
// Events are handled one at a time on this single loop, so the processor and the timer need no
// locking. The file, the socket and the peer binding live only as long as the loop does; they
// are released before the observer hears about the outcome.

use crate::config::ClientConfig;
use crate::observer::UploadObserver;
use crate::processor::{ResultAction, UploadProcessor};
use crate::tftp::{self, FileMode, Packet, TftpSocket};
use crate::timer::RetransmitTimer;
use rand::Rng;
use std::error;
use std::fmt;
use std::future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net;
use tokio::sync::watch;

/// Random local ports to try before letting the OS pick one.
const BIND_ATTEMPTS: usize = 8;

#[derive(Debug)]
pub enum UploadError {
    /// An upload is already in progress on this client.
    AlreadyRunning,
    /// The local file could not be opened or read.
    FileUnreadable(io::Error),
    /// The retry budget ran out waiting for an acknowledgement.
    Timeout,
    /// The server sent something an uploading client cannot act on.
    ProtocolViolation(String),
    /// The server aborted the transfer with an ERROR packet.
    RemoteError { code: u16, message: String },
    /// Resolving, binding, sending or receiving failed.
    TransportFailure(io::Error),
}

impl error::Error for UploadError {}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "Could not send file (client is already running)"),
            Self::FileUnreadable(e) => write!(f, "Failed to read file: {}", e),
            Self::Timeout => write!(f, "Timed out waiting for the server"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::RemoteError { code, message } => {
                write!(f, "Server error {} ({:?}): '{}'", code, tftp::ErrorCode::from(*code), message)
            }
            Self::TransportFailure(e) => write!(f, "Transport failure: {}", e),
        }
    }
}

impl From<tftp::SocketError> for UploadError {
    fn from(e: tftp::SocketError) -> UploadError {
        match e {
            tftp::SocketError::IO(e) => UploadError::TransportFailure(e),
            tftp::SocketError::PacketParse(msg) => UploadError::ProtocolViolation(msg),
        }
    }
}

/// How a `send_file` call that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server acknowledged the final block.
    Completed,
    /// `cancel` was called while the upload was running.
    Cancelled,
}

/// A TFTP client that uploads files to one server, one file at a time.
///
/// The client is meant to be shared (for example behind an `Arc`) so that another task can call
/// `cancel` or check `is_ready` while `send_file` is in progress.
pub struct TftpClient {
    config: ClientConfig,
    observer: Arc<dyn UploadObserver>,
    running: AtomicBool,
    cancel: watch::Sender<bool>,
}

/// Marks the client idle again when the upload ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TftpClient {
    pub fn new(config: ClientConfig, observer: Arc<dyn UploadObserver>) -> TftpClient {
        let (cancel, _) = watch::channel(false);
        TftpClient {
            config,
            observer,
            running: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a new upload may be started.
    pub fn is_ready(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Aborts the running upload, if any. The pending `send_file` call returns
    /// `UploadOutcome::Cancelled` and the observer is not notified.
    pub fn cancel(&self) {
        if !self.is_ready() {
            log::info!("Cancelling upload");
            self.cancel.send_replace(true);
        }
    }

    /// Uploads the file at `path` to the configured server under `name`.
    ///
    /// Fails immediately with `AlreadyRunning` if another upload is in progress, and with
    /// `FileUnreadable` before any packet is sent if the file cannot be opened. Every failure is
    /// also reported to the observer, as is completion.
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        name: &str,
        mode: FileMode,
    ) -> Result<UploadOutcome, UploadError> {
        let path = path.as_ref();
        if self.running.swap(true, Ordering::SeqCst) {
            let e = UploadError::AlreadyRunning;
            log::warn!("Refusing to upload {:#?}: {}", path, e);
            self.observer.did_fail(&e);
            return Err(e);
        }

        let result = {
            let _running = RunningGuard(&self.running);
            self.cancel.send_replace(false);
            let cancel_rx = self.cancel.subscribe();
            self.upload(path, name, mode, cancel_rx).await
        };

        match &result {
            Ok(UploadOutcome::Completed) => self.observer.did_complete(path, name),
            Ok(UploadOutcome::Cancelled) => log::info!("Upload of {:#?} cancelled", path),
            Err(e) => self.observer.did_fail(e),
        }
        result
    }

    async fn upload(
        &self,
        path: &Path,
        name: &str,
        mode: FileMode,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<UploadOutcome, UploadError> {
        let observer = self.observer.as_ref();
        let mut processor = UploadProcessor::open(path, name, mode, self.config.max_retries).await?;

        let server = resolve(&self.config.host, self.config.port).await?;
        let sock = bind_socket(&self.config, server)?;
        log::info!("Sending write request to {} from {}", server, sock.local_addr()?);

        let mut timer = RetransmitTimer::new();
        let mut action = processor.first_packet(observer);

        // This loop is used for message sending as well as retries, depending on which event
        // produced |action|.
        loop {
            match action {
                ResultAction::SendPacketAndAwait(packet) => {
                    let dst = processor.peer().unwrap_or(server);
                    if let Err(e) = sock.send(&packet, dst).await {
                        log::warn!("Unable to send packet: {e}");
                        return Err(e.into());
                    }
                    match packet {
                        Packet::WriteReq { .. } => observer.did_send_request(),
                        Packet::Data { block, .. } => observer.did_send_data_block(block),
                        _ => {}
                    }
                    timer.arm(self.config.timeout);
                }
                ResultAction::RetryRecv => {}
                ResultAction::Complete => {
                    log::info!("Upload of {:#?} complete", processor.path());
                    return Ok(UploadOutcome::Completed);
                }
                ResultAction::Fail(e) => return Err(e),
            }

            let peer = processor.peer();
            action = tokio::select! {
                _ = cancelled(&mut cancel_rx) => return Ok(UploadOutcome::Cancelled),
                _ = timer.expired() => processor.process_timeout(observer).await,
                received = sock.recv_filtered(peer) => {
                    let (packet, src) = received?;
                    log::debug!("Got packet from {}: {:?}", src, packet);
                    processor.process_packet(&packet, src, observer).await
                }
            };
        }
    }
}

/// Completes once the cancel flag is raised.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, UploadError> {
    net::lookup_host((host, port))
        .await
        .map_err(UploadError::TransportFailure)?
        .next()
        .ok_or_else(|| {
            UploadError::TransportFailure(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No address found for host '{host}'"),
            ))
        })
}

fn bind_socket(config: &ClientConfig, server: SocketAddr) -> tftp::TftpResult<TftpSocket> {
    let ip = config.local_ip.unwrap_or(match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    match config.local_port {
        Some(port) => TftpSocket::bind((ip, port).into()),
        None => bind_random_socket(ip),
    }
}

/// Attempts to bind to a random UDP port, leaving the choice to the OS if none of the attempts
/// succeeds.
fn bind_random_socket(ip: IpAddr) -> tftp::TftpResult<TftpSocket> {
    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        match TftpSocket::bind((ip, rng.gen_range(1024..65535)).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind socket: {e}"),
        }
    }
    TftpSocket::bind((ip, 0).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::{Event, RecordingObserver};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::net::UdpSocket;
    use tokio::time::{sleep, timeout};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_config(port: u16, retransmit_after: Duration) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: retransmit_after,
            max_retries: 3,
            local_ip: Some(Ipv4Addr::LOCALHOST.into()),
            local_port: None,
        }
    }

    async fn scratch_file(tmpdir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = tmpdir.path().join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    async fn recv_packet(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0_u8; 1024];
        let (n, src) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("nothing received")
            .unwrap();
        (Packet::parse_from_buf(&buf[..n]).unwrap(), src)
    }

    async fn nothing_received(sock: &UdpSocket, within: Duration) -> bool {
        let mut buf = [0_u8; 1024];
        timeout(within, sock.recv_from(&mut buf)).await.is_err()
    }

    async fn listener() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[tokio::test]
    async fn test_upload_multiple_of_block_size() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "report.txt", &[0x61; 1024]).await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = TftpClient::new(test_config(port, Duration::from_secs(2)), observer.clone());

        let server = tokio::spawn(async move {
            let (request, client_addr) = recv_packet(&listener).await;
            // Like a real server, carry on from a fresh port.
            let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut received = vec![request];
            let mut block = 0;
            loop {
                transfer.send_to(&Packet::Ack { block }.serialize(), client_addr).await.unwrap();
                if matches!(received.last(), Some(Packet::Data { data, .. }) if data.len() < 512) {
                    break;
                }
                let (packet, src) = recv_packet(&transfer).await;
                assert_eq!(src, client_addr);
                if let Packet::Data { block: b, .. } = &packet {
                    block = *b;
                }
                received.push(packet);
            }
            received
        });

        let outcome = client.send_file(&path, "report.txt", FileMode::Octet).await;
        assert!(matches!(outcome, Ok(UploadOutcome::Completed)), "{:?}", outcome);
        assert_eq!(
            server.await.unwrap(),
            vec![
                Packet::WriteReq { path: "report.txt".to_string(), mode: FileMode::Octet },
                Packet::Data { block: 1, data: vec![0x61; 512] },
                Packet::Data { block: 2, data: vec![0x61; 512] },
                Packet::Data { block: 3, data: vec![] },
            ]
        );
        assert!(client.is_ready());

        let events = observer.events();
        assert_eq!(events.last(), Some(&Event::Completed(path.clone(), "report.txt".to_string())));
        assert!(events.contains(&Event::DidSendRequest));
        assert!(events.contains(&Event::DidReceiveRequestAck));
        assert!(events.contains(&Event::DidSendBlock(3)));
        assert!(events.contains(&Event::DidSendBytes(1024, 1024)));
        assert!(!events.iter().any(|e| matches!(e, Event::Failed(_))));
    }

    #[tokio::test]
    async fn test_remote_error_on_request() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "report.txt", b"hello").await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = TftpClient::new(test_config(port, Duration::from_secs(2)), observer.clone());

        let server = tokio::spawn(async move {
            let (request, client_addr) = recv_packet(&listener).await;
            let error = Packet::Error { code: 1, message: "File already exists".to_string() };
            listener.send_to(&error.serialize(), client_addr).await.unwrap();
            (request, nothing_received(&listener, Duration::from_millis(300)).await)
        });

        match client.send_file(&path, "report.txt", FileMode::Octet).await {
            Err(UploadError::RemoteError { code, message }) => {
                assert_eq!(code, 1);
                assert_eq!(message, "File already exists");
            }
            other => panic!("Expected a remote error, got {:?}", other),
        }

        let (request, quiet) = server.await.unwrap();
        assert!(matches!(request, Packet::WriteReq { .. }));
        assert!(quiet, "no data may follow an error");
        assert!(client.is_ready());

        let events = observer.events();
        assert!(!events.iter().any(|e| matches!(e, Event::WillSendBlock(_))));
        assert!(matches!(events.last(), Some(Event::Failed(_))));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "report.txt", b"hello").await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = TftpClient::new(test_config(port, Duration::from_millis(50)), observer.clone());

        let server = tokio::spawn(async move {
            let mut requests = 0;
            let mut buf = [0_u8; 1024];
            while let Ok(received) = timeout(Duration::from_millis(500), listener.recv_from(&mut buf)).await {
                let (n, _) = received.unwrap();
                assert!(matches!(Packet::parse_from_buf(&buf[..n]), Ok(Packet::WriteReq { .. })));
                requests += 1;
            }
            requests
        });

        let outcome = client.send_file(&path, "report.txt", FileMode::Octet).await;
        assert!(matches!(outcome, Err(UploadError::Timeout)), "{:?}", outcome);
        assert!(client.is_ready());
        // The first request plus three retransmissions.
        assert_eq!(server.await.unwrap(), 4);
        assert_eq!(
            observer.events().iter().filter(|e| **e == Event::WillSendRequest).count(),
            4
        );
    }

    #[tokio::test]
    async fn test_lost_block_is_retransmitted() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "small.txt", b"hello").await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = TftpClient::new(test_config(port, Duration::from_millis(100)), observer.clone());

        let server = tokio::spawn(async move {
            let (_, client_addr) = recv_packet(&listener).await;
            let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            transfer.send_to(&Packet::Ack { block: 0 }.serialize(), client_addr).await.unwrap();

            // Drop the first copy of block 1 on the floor.
            let (first, _) = recv_packet(&transfer).await;
            let (second, _) = recv_packet(&transfer).await;
            transfer.send_to(&Packet::Ack { block: 1 }.serialize(), client_addr).await.unwrap();
            (first, second)
        });

        let outcome = client.send_file(&path, "small.txt", FileMode::Octet).await;
        assert!(matches!(outcome, Ok(UploadOutcome::Completed)), "{:?}", outcome);
        let (first, second) = server.await.unwrap();
        assert_eq!(first, Packet::Data { block: 1, data: b"hello".to_vec() });
        assert_eq!(first, second);
        assert_eq!(
            observer.events().iter().filter(|e| **e == Event::DidReceiveAck(1)).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_acks_from_other_addresses_are_ignored() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "small.txt", b"hello").await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = Arc::new(TftpClient::new(test_config(port, Duration::from_secs(2)), observer.clone()));

        let upload = {
            let client = client.clone();
            let path = path.clone();
            tokio::spawn(async move { client.send_file(&path, "small.txt", FileMode::Octet).await })
        };

        let (_, client_addr) = recv_packet(&listener).await;
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        transfer.send_to(&Packet::Ack { block: 0 }.serialize(), client_addr).await.unwrap();
        let (data, _) = recv_packet(&transfer).await;
        assert_eq!(data, Packet::Data { block: 1, data: b"hello".to_vec() });

        // A well-formed ack for the final block, but from the wrong port.
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder.send_to(&Packet::Ack { block: 1 }.serialize(), client_addr).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(!client.is_ready());
        assert!(!observer.events().contains(&Event::DidReceiveAck(1)));

        transfer.send_to(&Packet::Ack { block: 1 }.serialize(), client_addr).await.unwrap();
        let outcome = upload.await.unwrap();
        assert!(matches!(outcome, Ok(UploadOutcome::Completed)), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_second_upload_rejected_and_cancel() {
        init_logging();
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = scratch_file(&tmpdir, "big.bin", &[0x00; 4096]).await;
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = Arc::new(TftpClient::new(test_config(port, Duration::from_secs(5)), observer.clone()));
        assert!(client.is_ready());

        let upload = {
            let client = client.clone();
            let path = path.clone();
            tokio::spawn(async move { client.send_file(&path, "big.bin", FileMode::Octet).await })
        };

        // Once the request shows up the first upload is definitely running.
        recv_packet(&listener).await;
        assert!(!client.is_ready());

        let second = client.send_file(&path, "other.bin", FileMode::Octet).await;
        assert!(matches!(second, Err(UploadError::AlreadyRunning)), "{:?}", second);

        client.cancel();
        let outcome = timeout(Duration::from_secs(1), upload).await.unwrap().unwrap();
        assert!(matches!(outcome, Ok(UploadOutcome::Cancelled)), "{:?}", outcome);
        assert!(client.is_ready());

        // Only the rejected start is reported, cancelling is silent.
        let failures: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Failed(_) | Event::Completed(..)))
            .collect();
        assert_eq!(failures, vec![Event::Failed(UploadError::AlreadyRunning.to_string())]);

        // The client accepts work again, and the old cancellation does not leak into it.
        let retry = {
            let client = client.clone();
            tokio::spawn(async move { client.send_file(&path, "big.bin", FileMode::Octet).await })
        };
        let (request, _) = recv_packet(&listener).await;
        assert!(matches!(request, Packet::WriteReq { .. }));
        assert!(!client.is_ready());
        client.cancel();
        assert!(matches!(retry.await.unwrap(), Ok(UploadOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn test_unreadable_file_never_hits_the_network() {
        init_logging();
        let (listener, port) = listener().await;
        let observer = Arc::new(RecordingObserver::default());
        let client = TftpClient::new(test_config(port, Duration::from_secs(2)), observer.clone());

        let outcome = client.send_file("/some/invalid/file.txt", "x", FileMode::Octet).await;
        assert!(matches!(outcome, Err(UploadError::FileUnreadable(_))), "{:?}", outcome);
        assert!(client.is_ready());
        assert!(nothing_received(&listener, Duration::from_millis(200)).await);
        assert!(!observer.events().contains(&Event::WillSendRequest));
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_harmless() {
        let client = TftpClient::new(ClientConfig::default(), Arc::new(crate::observer::NoopObserver));
        client.cancel();
        assert!(client.is_ready());
        assert_eq!(client.config().port, 69);
    }

    #[test]
    fn test_socket_errors_map_to_upload_errors() {
        let io_err = tftp::SocketError::IO(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(UploadError::from(io_err), UploadError::TransportFailure(_)));
        let parse_err = tftp::SocketError::PacketParse("bad".to_string());
        assert!(matches!(UploadError::from(parse_err), UploadError::ProtocolViolation(_)));
    }
}
