//! Gratuitous ARP announcements over an `AF_PACKET` socket.

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IP: u16 = 0x0800;
const ARPHRD_ETHER: u16 = 1;
const ARPOP_REQUEST: u16 = 1;
const BROADCAST: [u8; 6] = [0xff; 6];

/// Build the 28-byte ARP payload announcing `ip` at `mac`.
pub fn announcement(ip: Ipv4Addr, mac: [u8; 6]) -> [u8; 28] {
    let mut frame = [0u8; 28];
    frame[0..2].copy_from_slice(&ARPHRD_ETHER.to_be_bytes());
    frame[2..4].copy_from_slice(&ETH_P_IP.to_be_bytes());
    frame[4] = 6;
    frame[5] = 4;
    frame[6..8].copy_from_slice(&ARPOP_REQUEST.to_be_bytes());
    frame[8..14].copy_from_slice(&mac);
    frame[14..18].copy_from_slice(&ip.octets());
    // target hardware address stays zero
    frame[24..28].copy_from_slice(&ip.octets());
    frame
}

/// Broadcast a gratuitous ARP for `ip` on `ifname` in the current namespace.
pub fn announce(ifname: &str, ip: Ipv4Addr, mac: [u8; 6]) -> Result<()> {
    let c_name = CString::new(ifname).context("interface name contains NUL")?;
    // SAFETY: c_name is a valid NUL-terminated string.
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to look up {}", ifname));
    }

    // SAFETY: plain socket(2) call; the descriptor is owned below.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            i32::from(ETH_P_ARP.to_be()),
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("failed to open packet socket");
    }
    // SAFETY: fd was just returned by socket(2) and is not owned elsewhere.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: sockaddr_ll is plain old data; zeroed is a valid starting value.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ARP.to_be();
    addr.sll_ifindex = ifindex as i32;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&BROADCAST);

    let payload = announcement(ip, mac);
    // SAFETY: payload and addr outlive the call; lengths match the buffers.
    let sent = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            payload.as_ptr().cast(),
            payload.len(),
            0,
            (&addr as *const libc::sockaddr_ll).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to send gratuitous ARP for {} on {}", ip, ifname));
    }
    if sent as usize != payload.len() {
        bail!("short write sending gratuitous ARP on {}", ifname);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_layout() {
        let mac = [0x0a, 0x58, 10, 0, 0, 5];
        let frame = announcement(Ipv4Addr::new(10, 0, 0, 5), mac);
        assert_eq!(&frame[0..8], &[0, 1, 8, 0, 6, 4, 0, 1]);
        assert_eq!(&frame[8..14], &mac);
        assert_eq!(&frame[14..18], &[10, 0, 0, 5]);
        assert_eq!(&frame[18..24], &[0; 6]);
        assert_eq!(&frame[24..28], &[10, 0, 0, 5]);
    }
}
