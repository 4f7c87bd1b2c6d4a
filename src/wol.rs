use crate::sys::{self, SysError};
use smoltcp::phy::{Device, Medium, RawSocket, TxToken};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
use std::io;
use thiserror::Error;
use tracing::info;

/// EtherType registered for wake-on-lan frames.
const ETHERTYPE_WOL: u16 = 0x0842;

const SYNC_LEN: usize = 6;
const MAC_REPETITIONS: usize = 16;

#[derive(Debug, Error)]
pub enum WolError {
    #[error(transparent)]
    Sys(#[from] SysError),
    #[error("failed to open raw socket on {iface}: {source}")]
    RawSocket { iface: String, source: io::Error },
    #[error("interface transmit buffer is full")]
    TxBusy,
}

/// The magic payload: six 0xff bytes, then the target MAC sixteen
/// times over.
pub fn magic_packet(mac: [u8; 6]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SYNC_LEN + MAC_REPETITIONS * mac.len());
    payload.extend_from_slice(&[0xff; SYNC_LEN]);
    for _ in 0..MAC_REPETITIONS {
        payload.extend_from_slice(&mac);
    }
    payload
}

/// Broadcasts a wake-on-lan frame for `mac` out of `iface`.
pub fn send(iface: &str, mac: [u8; 6]) -> Result<(), WolError> {
    let own_mac = sys::interface_mac(iface)?;
    let payload = magic_packet(mac);
    let mut socket =
        RawSocket::new(iface, Medium::Ethernet).map_err(|source| WolError::RawSocket {
            iface: iface.to_owned(),
            source,
        })?;
    let frame_len = EthernetFrame::<&[u8]>::header_len() + payload.len();
    let token = socket
        .transmit(Instant::from_micros_const(0))
        .ok_or(WolError::TxBusy)?;
    token.consume(frame_len, |buf| {
        let mut frame = EthernetFrame::new_unchecked(buf);
        frame.set_dst_addr(EthernetAddress::BROADCAST);
        frame.set_src_addr(EthernetAddress(own_mac));
        frame.set_ethertype(EthernetProtocol::Unknown(ETHERTYPE_WOL));
        frame.payload_mut()[..payload.len()].copy_from_slice(&payload);
    });
    info!(
        mac = %mac_address::MacAddress::new(mac),
        iface,
        "sent wake-on-lan packet"
    );
    Ok(())
}
