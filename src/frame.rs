use crate::capture::{PacketSink, SinkVerdict};
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::IpAddr;
use tracing::{debug, info};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
// fixed part only; extension headers stay part of the payload
const IPV6_HEADER_LEN: usize = 40;
// Linux cooked captures, v1 and v2, as produced on the "any" device
const SLL_HEADER_LEN: usize = 16;
const SLL2_HEADER_LEN: usize = 20;

/// Link-layer framing in effect on a capture handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    Unsupported(i32),
}

impl LinkType {
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => LinkType::Ethernet,
            113 => LinkType::LinuxSll,
            276 => LinkType::LinuxSll2,
            other => LinkType::Unsupported(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkSummary {
    pub ethertype: u16,
    pub header_len: usize,
}

#[derive(Clone, Debug)]
pub struct IpSummary {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: IpProtocol,
    pub header_len: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Tcp { syn: bool },
    Udp,
}

#[derive(Clone, Debug)]
pub struct TransportSummary {
    pub kind: TransportKind,
    pub source_port: u16,
    pub destination_port: u16,
}

/// Headers decoded from one captured frame. Layers that failed to
/// decode stay `None`; the frame only counts as caught when the IP
/// and transport layers are both present.
#[derive(Clone, Debug, Default)]
pub struct CapturedHeaders {
    pub link: Option<LinkSummary>,
    pub ip: Option<IpSummary>,
    pub transport: Option<TransportSummary>,
}

fn read_be16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn parse_link(link: LinkType, data: &[u8]) -> Option<LinkSummary> {
    let (ethertype, header_len) = match link {
        LinkType::Ethernet => (read_be16(data, 12)?, ETHERNET_HEADER_LEN),
        LinkType::LinuxSll => (read_be16(data, 14)?, SLL_HEADER_LEN),
        LinkType::LinuxSll2 => (read_be16(data, 0)?, SLL2_HEADER_LEN),
        LinkType::Unsupported(_) => return None,
    };
    if data.len() < header_len {
        return None;
    }
    // one VLAN tag may sit between the link header and the IP payload
    if ethertype == ETHERTYPE_VLAN {
        let inner = read_be16(data, header_len + 2)?;
        return Some(LinkSummary {
            ethertype: inner,
            header_len: header_len + VLAN_TAG_LEN,
        });
    }
    Some(LinkSummary {
        ethertype,
        header_len,
    })
}

fn parse_ip(ethertype: u16, data: &[u8]) -> Option<IpSummary> {
    match ethertype {
        ETHERTYPE_IPV4 => {
            let packet = Ipv4Packet::new_checked(data).ok()?;
            Some(IpSummary {
                source: IpAddr::V4(packet.src_addr()),
                destination: IpAddr::V4(packet.dst_addr()),
                protocol: packet.next_header(),
                header_len: usize::from(packet.header_len()),
            })
        }
        ETHERTYPE_IPV6 => {
            let packet = Ipv6Packet::new_checked(data).ok()?;
            Some(IpSummary {
                source: IpAddr::V6(packet.src_addr()),
                destination: IpAddr::V6(packet.dst_addr()),
                protocol: packet.next_header(),
                header_len: IPV6_HEADER_LEN,
            })
        }
        _ => None,
    }
}

fn parse_transport(protocol: IpProtocol, data: &[u8]) -> Option<TransportSummary> {
    match protocol {
        IpProtocol::Tcp => {
            let packet = TcpPacket::new_checked(data).ok()?;
            Some(TransportSummary {
                kind: TransportKind::Tcp { syn: packet.syn() },
                source_port: packet.src_port(),
                destination_port: packet.dst_port(),
            })
        }
        IpProtocol::Udp => {
            let packet = UdpPacket::new_checked(data).ok()?;
            Some(TransportSummary {
                kind: TransportKind::Udp,
                source_port: packet.src_port(),
                destination_port: packet.dst_port(),
            })
        }
        _ => None,
    }
}

/// Decodes as many layers as the frame allows, logging the first
/// missing one.
pub fn parse_headers(link: LinkType, data: &[u8]) -> CapturedHeaders {
    let mut headers = CapturedHeaders::default();

    let Some(link_summary) = parse_link(link, data) else {
        debug!(?link, "unsupported or truncated link layer");
        return headers;
    };
    let ip_data = &data[link_summary.header_len..];
    let ethertype = link_summary.ethertype;
    headers.link = Some(link_summary);

    let Some(ip) = parse_ip(ethertype, ip_data) else {
        debug!(ethertype, "unsupported link layer payload");
        return headers;
    };
    let transport_data = &ip_data[ip.header_len.min(ip_data.len())..];
    let protocol = ip.protocol;
    headers.ip = Some(ip);

    let Some(transport) = parse_transport(protocol, transport_data) else {
        debug!(protocol = %protocol, "unsupported ip payload");
        return headers;
    };
    headers.transport = Some(transport);
    headers
}

/// The connection attempt that ended a capture loop.
#[derive(Clone, Debug)]
pub struct CaughtConnection {
    /// Raw bytes of the triggering frame.
    pub frame: Vec<u8>,
    /// Client that tried to connect.
    pub source: IpAddr,
    /// Claimed address the client was aiming at.
    pub destination: IpAddr,
}

/// Packet sink that ends the capture loop on the first frame whose
/// link, IP and transport layers all decode. Anything else is logged
/// and skipped so the loop keeps listening.
pub struct SynCatcher {
    link: LinkType,
    pub caught: Option<CaughtConnection>,
}

impl SynCatcher {
    pub fn new(link: LinkType) -> Self {
        SynCatcher { link, caught: None }
    }
}

impl PacketSink for SynCatcher {
    fn deliver(&mut self, data: &[u8]) -> SinkVerdict {
        let headers = parse_headers(self.link, data);
        let (Some(ip), Some(transport)) = (headers.ip, headers.transport) else {
            return SinkVerdict::Continue;
        };
        info!(
            source = %ip.source,
            destination = %ip.destination,
            port = transport.destination_port,
            "caught connection attempt"
        );
        self.caught = Some(CaughtConnection {
            frame: data.to_vec(),
            source: ip.source,
            destination: ip.destination,
        });
        SinkVerdict::Complete
    }
}
