//! Original Destination Module
//!
//! Recovers the pre-redirection destination of an accepted connection. The
//! kernel hooks rewrite outbound connects to the local listener and answer
//! the `SO_ORIGINAL_DST` socket option with the stashed original address; this
//! module performs that query and decodes the returned sockaddr_in layout.
//!
//! On non-Linux builds the peer address is returned instead, which keeps the
//! data plane testable without the kernel machinery.

use crate::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;

/// Socket option number answered by the redirection hooks
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Byte length of the sockaddr_in payload:
/// family(2) + port(2, big-endian) + addr(4) + pad(8)
pub const SOCKADDR_IN_LEN: usize = 16;

/// Decode the 16-byte sockaddr_in layout returned by the getsockopt hook
pub fn decode_sockaddr_in(buffer: &[u8; SOCKADDR_IN_LEN]) -> SocketAddr {
    let port = u16::from_be_bytes([buffer[2], buffer[3]]);
    let addr = Ipv4Addr::new(buffer[4], buffer[5], buffer[6], buffer[7]);
    SocketAddr::new(IpAddr::V4(addr), port)
}

/// Retrieve the original destination of an accepted connection
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr> {
    use crate::ProxyError;
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut buffer = [0u8; SOCKADDR_IN_LEN];
    let mut length = SOCKADDR_IN_LEN as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            buffer.as_mut_ptr() as *mut libc::c_void,
            &mut length,
        )
    };
    if rc != 0 {
        return Err(ProxyError::Io(format!(
            "getsockopt SO_ORIGINAL_DST failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if (length as usize) < SOCKADDR_IN_LEN {
        return Err(ProxyError::Io(format!(
            "short SO_ORIGINAL_DST payload: {} bytes",
            length
        )));
    }

    Ok(decode_sockaddr_in(&buffer))
}

/// Non-Linux stand-in: the accepted peer address
#[cfg(not(target_os = "linux"))]
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr> {
    Ok(stream.peer_addr()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sockaddr_in() {
        let mut buffer = [0u8; SOCKADDR_IN_LEN];
        buffer[0] = libc::AF_INET as u8;
        // Port 18000 = 0x4650, big-endian on the wire
        buffer[2] = 0x46;
        buffer[3] = 0x50;
        buffer[4..8].copy_from_slice(&[192, 168, 1, 20]);

        let addr = decode_sockaddr_in(&buffer);
        assert_eq!(addr, "192.168.1.20:18000".parse().unwrap());
    }

    #[test]
    fn test_decode_port_byte_order() {
        let mut buffer = [0u8; SOCKADDR_IN_LEN];
        buffer[2] = 0x00;
        buffer[3] = 0x50;
        buffer[4..8].copy_from_slice(&[10, 0, 0, 1]);

        let addr = decode_sockaddr_in(&buffer);
        assert_eq!(addr.port(), 80);
        assert_eq!(addr.ip().to_string(), "10.0.0.1");
    }

    #[tokio::test]
    #[cfg(not(target_os = "linux"))]
    async fn test_fallback_returns_peer() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        assert_eq!(original_destination(&server).unwrap(), peer);
        drop(client);
    }
}
