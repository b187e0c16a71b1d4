//! Unix descriptor duplication over a local socketpair.
//!
//! The front process owns one end of a socketpair per worker; the worker
//! inherits the other end at launch. Each handoff sends the accepted socket
//! with `SCM_RIGHTS` together with the token bytes, and the same token then
//! travels on the TCP control channel. The worker pairs them up by sequence.
//!
//! Token layout: `target_pid: u32 LE`, `sequence: u64 LE`.
//!
//! The receiver never waits on the descriptor channel. A descriptor is sent
//! before its frame is written, so when a token is redeemed its descriptor
//! is already queued; a token whose descriptor is not there fails with
//! [`HandoffError::Unknown`]. This also covers platforms without
//! `SOCK_SEQPACKET`, where a `SOCK_DGRAM` pair never reports peer close.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use crate::handoff::{DuplicationToken, Duplicator, HandoffError, Reconstructor};

/// Environment variable carrying the inherited descriptor channel fd.
pub const DESCRIPTOR_FD_ENV: &str = "HANDOFF_DESCRIPTOR_FD";

const TOKEN_LEN: usize = 12;

/// Received descriptors whose token has not arrived yet.
const MAX_PENDING: usize = 256;

static INHERITED_TAKEN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TokenHeader {
    target_pid: u32,
    sequence: u64,
}

impl TokenHeader {
    fn to_le_bytes(self) -> [u8; TOKEN_LEN] {
        let mut buf = [0u8; TOKEN_LEN];
        buf[0..4].copy_from_slice(&self.target_pid.to_le_bytes());
        buf[4..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    fn parse(bytes: &[u8]) -> Result<Self, HandoffError> {
        if bytes.len() != TOKEN_LEN {
            return Err(HandoffError::Malformed { len: bytes.len() });
        }
        let mut pid = [0u8; 4];
        let mut seq = [0u8; 8];
        pid.copy_from_slice(&bytes[0..4]);
        seq.copy_from_slice(&bytes[4..12]);
        Ok(Self {
            target_pid: u32::from_le_bytes(pid),
            sequence: u64::from_le_bytes(seq),
        })
    }
}

/// Create a connected, non-blocking, close-on-exec socketpair for descriptor passing.
pub fn channel_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    // SEQPACKET reports peer close as EOF; other unixes fall back to DGRAM.
    #[cfg(target_os = "linux")]
    let sock_type = libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let sock_type = libc::SOCK_DGRAM;

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: socketpair succeeded, both fds are fresh and owned by us.
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(target_os = "linux"))]
    {
        set_cloexec(a.as_raw_fd(), true)?;
        set_cloexec(b.as_raw_fd(), true)?;
    }
    set_nonblocking(a.as_raw_fd())?;
    set_nonblocking(b.as_raw_fd())?;

    Ok((a, b))
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Toggle `FD_CLOEXEC`. Clearing it is how the worker end survives `exec`.
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_fd_with_payload(sock_fd: RawFd, fd: RawFd, payload: &[u8; TOKEN_LEN]) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fds = [fd];
    let data_len = std::mem::size_of_val(&fds);
    let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
    let mut control = vec![0u8; cmsg_space];

    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "failed to build cmsg header",
        ));
    }

    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
        std::ptr::copy_nonoverlapping(fds.as_ptr(), data_ptr, 1);
    }

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = unsafe { libc::sendmsg(sock_fd, &msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::Error::new(ErrorKind::WriteZero, "sendmsg wrote 0 bytes"));
    }
    Ok(())
}

fn recv_fd_with_payload(sock_fd: RawFd) -> io::Result<(OwnedFd, [u8; TOKEN_LEN])> {
    let mut payload = [0u8; TOKEN_LEN];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    let data_len = std::mem::size_of::<RawFd>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
    let mut control = vec![0u8; cmsg_space];

    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = unsafe { libc::recvmsg(sock_fd, &mut msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received_fd: Option<OwnedFd> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                if cmsg_len >= base_len + std::mem::size_of::<RawFd>() {
                    let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    // SAFETY: the kernel installed this fd for us via SCM_RIGHTS.
                    received_fd = Some(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data_ptr)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }

    if n == 0 && received_fd.is_none() {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "descriptor channel closed",
        ));
    }
    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "control message truncated",
        ));
    }
    if (n as usize) < TOKEN_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "short read on descriptor channel",
        ));
    }

    let fd = received_fd.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidData, "no fd received in control message")
    })?;
    Ok((fd, payload))
}

/// Front-side half of a descriptor channel, bound to one worker process.
#[derive(Debug)]
pub struct DescriptorSender {
    fd: AsyncFd<OwnedFd>,
    target_pid: u32,
    next_sequence: AtomicU64,
}

impl DescriptorSender {
    /// Must be called from within a Tokio runtime.
    pub fn new(fd: OwnedFd, target_pid: u32) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            target_pid,
            next_sequence: AtomicU64::new(1),
        })
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }
}

#[async_trait]
impl Duplicator for DescriptorSender {
    async fn duplicate_and_close(
        &self,
        socket: std::net::TcpStream,
    ) -> Result<DuplicationToken, HandoffError> {
        let header = TokenHeader {
            target_pid: self.target_pid,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        };
        let payload = header.to_le_bytes();
        let socket = OwnedFd::from(socket);

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                send_fd_with_payload(inner.get_ref().as_raw_fd(), socket.as_raw_fd(), &payload)
            }) {
                Ok(result) => {
                    result?;
                    break;
                }
                Err(_would_block) => continue,
            }
        }

        // The worker holds its own reference now; release ours.
        drop(socket);

        tracing::trace!(
            target_pid = header.target_pid,
            sequence = header.sequence,
            "Socket duplicated"
        );
        Ok(DuplicationToken::from_bytes(Bytes::copy_from_slice(&payload)))
    }
}

#[derive(Debug, Default)]
struct ReceiveState {
    pending: BTreeMap<u64, OwnedFd>,
    highest: Option<u64>,
}

/// Worker-side half of a descriptor channel.
#[derive(Debug)]
pub struct DescriptorReceiver {
    fd: OwnedFd,
    pid: u32,
    state: Mutex<ReceiveState>,
}

impl DescriptorReceiver {
    /// Wrap a descriptor channel end for the current process.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        set_cloexec(fd.as_raw_fd(), true)?;
        Ok(Self {
            fd,
            pid: std::process::id(),
            state: Mutex::new(ReceiveState::default()),
        })
    }

    /// Adopt the channel end inherited from the front process, as named by
    /// [`DESCRIPTOR_FD_ENV`]. Succeeds at most once per process.
    pub fn from_env() -> io::Result<Self> {
        let raw = std::env::var(DESCRIPTOR_FD_ENV).map_err(|_| {
            io::Error::new(
                ErrorKind::NotFound,
                format!("{DESCRIPTOR_FD_ENV} is not set"),
            )
        })?;
        let fd: RawFd = raw.trim().parse().map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("{DESCRIPTOR_FD_ENV}={raw}: {e}"),
            )
        })?;

        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if INHERITED_TAKEN.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "inherited descriptor channel already adopted",
            ));
        }

        // SAFETY: the launch contract hands this fd to us exclusively and the
        // guard above ensures it is wrapped only once.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::new(fd)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Move every descriptor already queued on the channel into `state`.
    ///
    /// Never waits: the front sends a descriptor before writing its frame,
    /// so anything a valid token refers to is queued by the time we look.
    fn drain_ready(&self, state: &mut ReceiveState) -> Result<(), HandoffError> {
        loop {
            let (fd, payload) = match recv_fd_with_payload(self.fd.as_raw_fd()) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let received = match TokenHeader::parse(&payload) {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding descriptor with unreadable metadata");
                    continue;
                }
            };

            state.highest = Some(state.highest.map_or(received.sequence, |h| h.max(received.sequence)));
            state.pending.insert(received.sequence, fd);

            if state.pending.len() > MAX_PENDING {
                if let Some((sequence, _fd)) = state.pending.pop_first() {
                    tracing::warn!(sequence, "Dropping unclaimed descriptor");
                }
            }
        }
    }
}

#[async_trait]
impl Reconstructor for DescriptorReceiver {
    async fn reconstruct(
        &self,
        token: &DuplicationToken,
    ) -> Result<std::net::TcpStream, HandoffError> {
        let header = TokenHeader::parse(token.as_bytes())?;
        if header.target_pid != self.pid {
            return Err(HandoffError::WrongProcess {
                expected: header.target_pid,
                actual: self.pid,
            });
        }

        let mut state = self.state.lock().await;
        if let Some(fd) = state.pending.remove(&header.sequence) {
            return Ok(std::net::TcpStream::from(fd));
        }
        if state.highest.is_some_and(|h| header.sequence <= h) {
            return Err(HandoffError::AlreadyConsumed {
                sequence: header.sequence,
            });
        }

        self.drain_ready(&mut state)?;
        if let Some(fd) = state.pending.remove(&header.sequence) {
            return Ok(std::net::TcpStream::from(fd));
        }
        if state.highest.is_some_and(|h| header.sequence <= h) {
            return Err(HandoffError::AlreadyConsumed {
                sequence: header.sequence,
            });
        }
        Err(HandoffError::Unknown {
            sequence: header.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn local_channel() -> (DescriptorSender, DescriptorReceiver) {
        let (a, b) = channel_pair().unwrap();
        let sender = DescriptorSender::new(a, std::process::id()).unwrap();
        let receiver = DescriptorReceiver::new(b).unwrap();
        (sender, receiver)
    }

    #[tokio::test]
    async fn reconstructed_socket_talks_to_original_peer() {
        let (sender, receiver) = local_channel();
        let (mut client, server) = tcp_pair().await;

        let token = sender
            .duplicate_and_close(server.into_std().unwrap())
            .await
            .unwrap();
        assert_eq!(token.len(), TOKEN_LEN);

        let mut rebuilt = into_tokio(receiver.reconstruct(&token).await.unwrap());

        rebuilt.write_all(b"handed off").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"handed off");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        rebuilt.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sender_descriptor_is_closed_after_duplication() {
        let (sender, _receiver) = local_channel();
        let (_client, server) = tcp_pair().await;

        let std_stream = server.into_std().unwrap();
        let raw = std_stream.as_raw_fd();
        sender.duplicate_and_close(std_stream).await.unwrap();

        let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_eq!(flags, -1, "sender fd still open after handoff");
    }

    #[tokio::test]
    async fn token_cannot_be_consumed_twice() {
        let (sender, receiver) = local_channel();
        let (_client, server) = tcp_pair().await;

        let token = sender
            .duplicate_and_close(server.into_std().unwrap())
            .await
            .unwrap();
        receiver.reconstruct(&token).await.unwrap();

        match receiver.reconstruct(&token).await {
            Err(HandoffError::AlreadyConsumed { sequence }) => assert_eq!(sequence, 1),
            other => panic!("expected AlreadyConsumed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_for_another_process_is_rejected() {
        let (_sender, receiver) = local_channel();
        let foreign = TokenHeader {
            target_pid: std::process::id().wrapping_add(1),
            sequence: 1,
        };
        let token = DuplicationToken::from_bytes(foreign.to_le_bytes().to_vec());

        assert!(matches!(
            receiver.reconstruct(&token).await,
            Err(HandoffError::WrongProcess { .. })
        ));
    }

    #[tokio::test]
    async fn empty_token_is_malformed() {
        let (_sender, receiver) = local_channel();
        let token = DuplicationToken::from_bytes(Bytes::new());
        assert!(matches!(
            receiver.reconstruct(&token).await,
            Err(HandoffError::Malformed { len: 0 })
        ));
    }

    #[tokio::test]
    async fn tokens_may_be_redeemed_out_of_order() {
        let (sender, receiver) = local_channel();
        let (mut first_client, first) = tcp_pair().await;
        let (mut second_client, second) = tcp_pair().await;

        let first_token = sender
            .duplicate_and_close(first.into_std().unwrap())
            .await
            .unwrap();
        let second_token = sender
            .duplicate_and_close(second.into_std().unwrap())
            .await
            .unwrap();

        let mut second = into_tokio(receiver.reconstruct(&second_token).await.unwrap());
        let mut first = into_tokio(receiver.reconstruct(&first_token).await.unwrap());

        second.write_all(b"2").await.unwrap();
        first.write_all(b"1").await.unwrap();

        let mut buf = [0u8; 1];
        second_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");
        first_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1");
    }

    #[tokio::test]
    async fn token_without_descriptor_fails_without_waiting() {
        let (sender, receiver) = local_channel();
        let missing = TokenHeader {
            target_pid: std::process::id(),
            sequence: 999,
        };
        let token = DuplicationToken::from_bytes(missing.to_le_bytes().to_vec());

        let result = tokio::time::timeout(Duration::from_secs(1), receiver.reconstruct(&token))
            .await
            .expect("reconstruct waited for a descriptor that was never sent");
        assert!(matches!(result, Err(HandoffError::Unknown { sequence: 999 })));

        let (_client, server) = tcp_pair().await;
        let token = sender
            .duplicate_and_close(server.into_std().unwrap())
            .await
            .unwrap();
        assert!(receiver.reconstruct(&token).await.is_ok());
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let (sender, receiver) = local_channel();
        drop(sender);
        let token = DuplicationToken::from_bytes(
            TokenHeader {
                target_pid: std::process::id(),
                sequence: 1,
            }
            .to_le_bytes()
            .to_vec(),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), receiver.reconstruct(&token))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(HandoffError::Channel(_)) | Err(HandoffError::Unknown { .. })
        ));
    }

    fn into_tokio(stream: std::net::TcpStream) -> TcpStream {
        stream.set_nonblocking(true).unwrap();
        TcpStream::from_std(stream).unwrap()
    }
}
