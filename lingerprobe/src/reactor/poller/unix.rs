use libc::{
    AF_INET, AF_INET6, IPPROTO_TCP, MSG_NOSIGNAL, O_CLOEXEC, SHUT_RD, SHUT_RDWR, SHUT_WR, SO_DOMAIN, SO_ERROR,
    SO_LINGER, SO_PROTOCOL, SO_TYPE, SOCK_CLOEXEC, SOCK_NONBLOCK, SOL_SOCKET, TCP_INFO, accept4, bind,
    c_char, c_int, c_void, close, connect, dup3, getpeername, getsockname, getsockopt, linger,
    listen, recv, send, setsockopt, shutdown, sockaddr, sockaddr_in, sockaddr_in6,
    sockaddr_storage, socket, socklen_t, tcp_info,
};
use std::ffi::CStr;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::time::Duration;
use std::{io, mem};

/// Parameters needed to create a socket of the same family, type and
/// protocol as an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ProtocolInfo {
    pub(crate) domain: c_int,
    pub(crate) ty: c_int,
    pub(crate) protocol: c_int,
}

/// Maps a libc return code to `io::Result`.
fn check(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Creates a non-blocking, close-on-exec socket.
pub(crate) fn sys_socket(info: ProtocolInfo) -> io::Result<RawFd> {
    check(unsafe {
        socket(
            info.domain,
            info.ty | SOCK_NONBLOCK | SOCK_CLOEXEC,
            info.protocol,
        )
    })
}

/// Reads an integer socket option.
fn sys_getsockopt_int(fd: RawFd, level: c_int, name: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    check(unsafe { getsockopt(fd, level, name, &mut value as *mut _ as *mut c_void, &mut len) })?;

    Ok(value)
}

/// Queries the family, type and protocol of an existing socket.
pub(crate) fn sys_protocol_info(fd: RawFd) -> io::Result<ProtocolInfo> {
    Ok(ProtocolInfo {
        domain: sys_getsockopt_int(fd, SOL_SOCKET, SO_DOMAIN)?,
        ty: sys_getsockopt_int(fd, SOL_SOCKET, SO_TYPE)?,
        protocol: sys_getsockopt_int(fd, SOL_SOCKET, SO_PROTOCOL)?,
    })
}

/// Binds a socket to an address.
pub(crate) fn sys_bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    check(unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) })?;

    Ok(())
}

/// Marks a socket as a listening socket.
pub(crate) fn sys_listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    check(unsafe { listen(fd, backlog) })?;

    Ok(())
}

/// Accepts a new incoming connection.
///
/// The returned socket is non-blocking and close-on-exec.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client_fd = check(unsafe {
        accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            SOCK_NONBLOCK | SOCK_CLOEXEC,
        )
    })?;

    match sockaddr_storage_to_socketaddr(&storage) {
        Ok(addr) => Ok((client_fd, addr)),
        Err(e) => {
            sys_close(client_fd);
            Err(e)
        }
    }
}

/// Makes `target` refer to the same open socket as `source`.
///
/// Whatever `target` referred to before is closed atomically.
pub(crate) fn sys_dup_onto(source: RawFd, target: RawFd) -> io::Result<()> {
    check(unsafe { dup3(source, target, O_CLOEXEC) })?;

    Ok(())
}

/// Receives into `buffer`. `Ok(0)` means the peer closed its side.
pub(crate) fn sys_recv(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { recv(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sends from `buffer` without raising `SIGPIPE` on a reset connection.
pub(crate) fn sys_send(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        send(
            fd,
            buffer.as_ptr() as *const c_void,
            buffer.len(),
            MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Initiates a non-blocking connection.
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    check(unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) })?;

    Ok(())
}

/// Shuts down a socket.
pub(crate) fn sys_shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => SHUT_RD,
        Shutdown::Write => SHUT_WR,
        Shutdown::Both => SHUT_RDWR,
    };

    check(unsafe { shutdown(fd, how) })?;

    Ok(())
}

/// Returns the local address of a socket.
pub(crate) fn sys_sockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    check(unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) })?;

    sockaddr_storage_to_socketaddr(&storage)
}

/// Returns the remote address of a connected socket.
pub(crate) fn sys_peername(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    check(unsafe { getpeername(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) })?;

    sockaddr_storage_to_socketaddr(&storage)
}

/// Retrieves and clears the pending socket error via `SO_ERROR`.
pub(crate) fn sys_take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let err = sys_getsockopt_int(fd, SOL_SOCKET, SO_ERROR)?;

    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Reads the kernel's TCP state (`TCP_INFO`).
///
/// Unlike `SO_ERROR`, this read has no side effect on the socket.
pub(crate) fn sys_tcp_state(fd: RawFd) -> io::Result<u8> {
    let mut info: tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<tcp_info>() as socklen_t;

    check(unsafe {
        getsockopt(
            fd,
            IPPROTO_TCP,
            TCP_INFO,
            &mut info as *mut _ as *mut c_void,
            &mut len,
        )
    })?;

    Ok(info.tcpi_state)
}

/// Sets `SO_LINGER`.
///
/// `Some(Duration::ZERO)` turns the next close into an abortive reset.
pub(crate) fn sys_set_linger(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    let value = linger {
        l_onoff: timeout.is_some() as c_int,
        l_linger: timeout.map(|t| t.as_secs() as c_int).unwrap_or(0),
    };

    check(unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_LINGER,
            &value as *const _ as *const c_void,
            mem::size_of::<linger>() as socklen_t,
        )
    })?;

    Ok(())
}

/// Resolves an OS error code to its textual description.
pub(crate) fn sys_strerror(code: c_int) -> String {
    let mut buffer = [0 as c_char; 256];

    let rc = unsafe { libc::strerror_r(code, buffer.as_mut_ptr(), buffer.len()) };
    if rc != 0 {
        return format!("unknown error {code}");
    }

    unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Converts a `sockaddr_storage` to a Rust `SocketAddr`.
pub(crate) fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_conversion_preserves_port_and_ip() {
        let addr: SocketAddr = "127.0.0.1:40404".parse().unwrap();
        let (storage, len) = socketaddr_to_storage(&addr);

        assert_eq!(len as usize, mem::size_of::<sockaddr_in>());
        assert_eq!(sockaddr_storage_to_socketaddr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_sockaddr_v6_conversion_preserves_scope() {
        let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 8080, 0, 3));
        let (storage, _) = socketaddr_to_storage(&addr);

        assert_eq!(sockaddr_storage_to_socketaddr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let storage: sockaddr_storage = unsafe { mem::zeroed() };
        let err = sockaddr_storage_to_socketaddr(&storage).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_strerror_describes_connection_reset() {
        let text = sys_strerror(libc::ECONNRESET);
        assert!(text.to_lowercase().contains("reset"), "got {text:?}");
    }

    #[test]
    fn test_protocol_info_round_trips_through_socket() {
        let info = ProtocolInfo {
            domain: AF_INET,
            ty: libc::SOCK_STREAM,
            protocol: 0,
        };
        let fd = sys_socket(info).unwrap();

        let queried = sys_protocol_info(fd).unwrap();
        sys_close(fd);

        assert_eq!(queried.domain, AF_INET);
        assert_eq!(queried.ty, libc::SOCK_STREAM);
        assert_eq!(queried.protocol, libc::IPPROTO_TCP);
    }
}
