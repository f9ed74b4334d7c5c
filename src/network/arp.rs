// Gratuitous ARP announcements for freshly configured IPv4 addresses

use crate::network::error::NetworkResult;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IP: u16 = 0x0800;
const ARP_HTYPE_ETHER: u16 = 1;
const ARP_OP_REQUEST: u16 = 1;
const BROADCAST: [u8; 6] = [0xff; 6];

pub const FRAME_LEN: usize = 42;

/// Broadcast ARP request announcing `ip` at `mac`, sender and target
/// protocol address both set to `ip`.
pub fn garp_frame(mac: [u8; 6], ip: Ipv4Addr) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    let ip = ip.octets();

    // Ethernet header
    frame[0..6].copy_from_slice(&BROADCAST);
    frame[6..12].copy_from_slice(&mac);
    frame[12..14].copy_from_slice(&ETH_P_ARP.to_be_bytes());

    // ARP payload
    frame[14..16].copy_from_slice(&ARP_HTYPE_ETHER.to_be_bytes());
    frame[16..18].copy_from_slice(&ETH_P_IP.to_be_bytes());
    frame[18] = 6;
    frame[19] = 4;
    frame[20..22].copy_from_slice(&ARP_OP_REQUEST.to_be_bytes());
    frame[22..28].copy_from_slice(&mac);
    frame[28..32].copy_from_slice(&ip);
    frame[32..38].copy_from_slice(&BROADCAST);
    frame[38..42].copy_from_slice(&ip);
    frame
}

/// Send one gratuitous ARP out of `ifindex` in the calling thread's namespace.
pub fn send_garp(ifindex: u32, mac: [u8; 6], ip: Ipv4Addr) -> NetworkResult<()> {
    let frame = garp_frame(mac, ip);

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            ETH_P_ARP.to_be() as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ARP.to_be();
    addr.sll_ifindex = ifindex as i32;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&BROADCAST);

    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    tracing::debug!("Sent gratuitous ARP for {} on ifindex {}", ip, ifindex);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let mac = [0x0a, 0x58, 0x0a, 0x01, 0x02, 0x05];
        let frame = garp_frame(mac, Ipv4Addr::new(10, 1, 2, 5));

        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &mac);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[14..22], &[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        assert_eq!(&frame[22..28], &mac);
        assert_eq!(&frame[28..32], &[10, 1, 2, 5]);
        assert_eq!(&frame[32..38], &[0xff; 6]);
        assert_eq!(&frame[38..42], &[10, 1, 2, 5]);
    }
}
