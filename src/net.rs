//! Socket plumbing shared by both proxies.
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::errors::Error;

/// Pick a random free TCP port by binding to port 0 and returning the assigned port.
pub fn pick_free_port() -> Result<u16> {
    let sock = TcpListener::bind(("127.0.0.1", 0))?;
    let port = sock.local_addr()?.port();
    drop(sock);
    Ok(port)
}

/// Bind a listener with an explicit backlog. Failures surface as
/// `FailedToBind`, which is fatal at startup.
pub fn listen(addr: &str, backlog: i32) -> std::result::Result<TcpListener, Error> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|_| Error::FailedToBind(addr.to_string()))?;
    let domain = Domain::for_address(parsed);
    let bind = || -> std::io::Result<TcpListener> {
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&parsed.into())?;
        sock.listen(backlog)?;
        Ok(sock.into())
    };
    bind().map_err(|_| Error::FailedToBind(addr.to_string()))
}

/// Connect with a bounded timeout, trying each resolved address.
pub fn connect(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    use std::net::ToSocketAddrs;
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(sock) => return Ok(sock),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ErrorKind::InvalidInput.into()))
}

/// `SO_LINGER {on, 0}` so close drops the connection immediately.
pub fn set_nolinger(sock: &TcpStream) {
    let _ = SockRef::from(sock).set_linger(Some(Duration::from_secs(0)));
}

/// Tear a socket down, optionally with a hard shutdown first.
pub fn close_stream(sock: &TcpStream, forceful: bool) {
    if forceful {
        let _ = sock.shutdown(Shutdown::Both);
    }
}

/// Write the whole buffer. Returns whether anything was delivered, which is
/// what liveness tracking wants to know.
pub fn send_all(sock: &mut TcpStream, msg: &[u8]) -> bool {
    let mut total = 0;
    while total < msg.len() {
        match sock.write(&msg[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(_) => break,
        }
    }
    total > 0
}

/// Drain whatever the socket has within `wait`, then return. The flag is
/// liveness: `false` only when the peer has closed (or errored) and nothing
/// further will arrive.
pub fn recv_available(sock: &TcpStream, wait: Duration, block_size: usize) -> (bool, Vec<u8>) {
    let mut sock = sock;
    let mut data = Vec::new();
    let mut buf = vec![0u8; block_size.max(1)];
    let _ = sock.set_read_timeout(Some(wait.max(Duration::from_millis(1))));
    loop {
        match sock.read(&mut buf) {
            Ok(0) => return (!data.is_empty(), data),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return (true, data)
            }
            Err(_) => return (!data.is_empty(), data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn send_and_drain_over_loopback() {
        let listener = listen("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            assert!(send_all(&mut peer, b"hello from the other side"));
        });
        let sock = TcpStream::connect(addr).unwrap();
        let mut got = Vec::new();
        while got.len() < 25 {
            let (alive, data) = recv_available(&sock, Duration::from_millis(50), 4096);
            assert!(alive || !got.is_empty());
            got.extend_from_slice(&data);
        }
        assert_eq!(got, b"hello from the other side");
        handle.join().unwrap();
    }

    #[test]
    fn eof_reports_dead_once_drained() {
        let listener = listen("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
        let (alive, data) = recv_available(&sock, Duration::from_millis(50), 4096);
        assert!(!alive);
        assert!(data.is_empty());
    }

    #[test]
    fn bad_address_fails_to_bind() {
        assert!(matches!(
            listen("not-an-addr", 16),
            Err(Error::FailedToBind(_))
        ));
    }
}
