use crate::reactor::poller::platform::{
    ProtocolInfo, sys_bind, sys_close, sys_listen, sys_peername, sys_protocol_info,
    sys_set_linger, sys_socket, sys_sockname, sys_tcp_state,
};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Connection state as tracked by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    /// Fully closed, for example after a reset.
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Other(u8),
}

impl TcpState {
    fn from_raw(state: u8) -> Self {
        match state {
            1 => TcpState::Established,
            2 => TcpState::SynSent,
            3 => TcpState::SynRecv,
            4 => TcpState::FinWait1,
            5 => TcpState::FinWait2,
            6 => TcpState::TimeWait,
            7 => TcpState::Close,
            8 => TcpState::CloseWait,
            9 => TcpState::LastAck,
            10 => TcpState::Listen,
            11 => TcpState::Closing,
            other => TcpState::Other(other),
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::Closing => "CLOSING",
            TcpState::Other(raw) => return write!(f, "state {raw}"),
        };
        f.write_str(name)
    }
}

/// An owned, non-blocking TCP socket.
///
/// `Socket` is the handle every role slot holds. It never performs I/O
/// itself: reads, writes, accepts and connects are issued as operations
/// through the reactor. The descriptor is closed when the socket is dropped.
pub struct Socket {
    /// File descriptor of the socket.
    fd: RawFd,
}

impl Socket {
    /// Creates an IPv4 TCP socket.
    pub fn tcp_v4() -> io::Result<Self> {
        Self::new(ProtocolInfo {
            domain: libc::AF_INET,
            ty: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
        })
    }

    fn new(info: ProtocolInfo) -> io::Result<Self> {
        Ok(Self {
            fd: sys_socket(info)?,
        })
    }

    /// Creates a socket with the same family, type and protocol as `other`.
    ///
    /// Used to prepare the socket an accept will complete onto.
    pub fn with_protocol_of(other: &Socket) -> io::Result<Self> {
        Self::new(sys_protocol_info(other.fd)?)
    }

    /// Raw descriptor, also used as the socket's identity in logs.
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        sys_bind(self.fd, addr)
    }

    /// Starts listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        sys_listen(self.fd, backlog)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys_sockname(self.fd)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys_peername(self.fd)
    }

    /// Kernel TCP state of the connection.
    ///
    /// Read through `TCP_INFO`, so a pending socket error is left in place
    /// for the next operation to report.
    pub fn tcp_state(&self) -> io::Result<TcpState> {
        sys_tcp_state(self.fd).map(TcpState::from_raw)
    }

    /// Sets a zero linger timeout so that closing the socket resets the
    /// connection instead of draining it.
    pub fn set_abortive_linger(&self) -> io::Result<()> {
        sys_set_linger(self.fd, Some(Duration::ZERO))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Socket").field(&self.fd).finish()
    }
}

impl Drop for Socket {
    /// Closes the socket.
    fn drop(&mut self) {
        sys_close(self.fd);
    }
}
