use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Ports a magic packet is sent to; NICs listen on either.
pub const WOL_PORTS: [u16; 2] = [7, 9];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address '{0}'")]
pub struct InvalidMac(pub String);

/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabbccddeeff`.
pub fn parse_mac(input: &str) -> Result<[u8; 6], InvalidMac> {
    let invalid = || InvalidMac(input.to_string());
    let hex: String = input
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let mut mac = [0_u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(mac)
}

/// Six 0xFF bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut packet = [0xFF_u8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

pub async fn wake(mac: [u8; 6]) -> io::Result<()> {
    send_magic_packet(mac, Ipv4Addr::BROADCAST, &WOL_PORTS).await
}

pub async fn send_magic_packet(mac: [u8; 6], target: Ipv4Addr, ports: &[u16]) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let packet = magic_packet(mac);
    for &port in ports {
        let addr = SocketAddr::from((target, port));
        socket.send_to(&packet, addr).await?;
        debug!(%addr, "magic packet sent");
    }
    Ok(())
}
