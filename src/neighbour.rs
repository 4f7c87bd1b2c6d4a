use crate::addr::Address;
use crate::sys::{self, CommandError, SysError};
use smoltcp::phy::{Device, Medium, RawSocket, TxToken};
use smoltcp::time::Instant;
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Reachability state of a neighbour-table entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NeighbourState {
    Reachable,
    Stale,
    Probe,
    Delay,
    Permanent,
    Incomplete,
    Failed,
    Noarp,
    Other(String),
}

impl NeighbourState {
    fn parse(token: &str) -> Self {
        match token {
            "REACHABLE" => NeighbourState::Reachable,
            "STALE" => NeighbourState::Stale,
            "PROBE" => NeighbourState::Probe,
            "DELAY" => NeighbourState::Delay,
            "PERMANENT" => NeighbourState::Permanent,
            "INCOMPLETE" => NeighbourState::Incomplete,
            "FAILED" => NeighbourState::Failed,
            "NOARP" => NeighbourState::Noarp,
            other => NeighbourState::Other(other.to_owned()),
        }
    }

    /// States that prove another station answers for the address.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            NeighbourState::Reachable | NeighbourState::Stale | NeighbourState::Probe
        )
    }
}

/// One `ip neigh` line: `<addr> dev <iface> lladdr <mac> [router] <state>`.
#[derive(Clone, Debug)]
pub struct NeighbourEntry {
    pub ip: IpAddr,
    pub iface: String,
    pub lladdr: Option<[u8; 6]>,
    pub state: NeighbourState,
}

/// Parses one neighbour-table line; unparsable lines yield `None`.
pub fn parse_neighbour_line(line: &str) -> Option<NeighbourEntry> {
    let mut tokens = line.split_whitespace();
    let ip: IpAddr = tokens.next()?.parse().ok()?;
    let mut iface = None;
    let mut lladdr = None;
    let mut state = None;
    while let Some(token) = tokens.next() {
        match token {
            "dev" => iface = tokens.next().map(str::to_owned),
            "lladdr" => {
                lladdr = tokens
                    .next()
                    .and_then(|mac| mac.parse::<mac_address::MacAddress>().ok())
                    .map(|mac| mac.bytes())
            }
            "router" | "proxy" | "extern_learn" => {}
            other => state = Some(NeighbourState::parse(other)),
        }
    }
    Some(NeighbourEntry {
        ip,
        iface: iface?,
        lladdr,
        state: state?,
    })
}

pub fn parse_neighbour_table(output: &str) -> Vec<NeighbourEntry> {
    output.lines().filter_map(parse_neighbour_line).collect()
}

/// Whether the snapshot shows `ip` answered for by some other station
/// on `iface`. An entry without a link-layer address proves nothing,
/// and an entry carrying our own MAC is the proxy itself.
pub fn has_neighbour_ip(
    iface: &str,
    ip: &IpAddr,
    entries: &[NeighbourEntry],
    own_mac: Option<[u8; 6]>,
) -> bool {
    entries.iter().any(|entry| {
        entry.iface == iface
            && entry.ip == *ip
            && entry.state.is_held()
            && match entry.lladdr {
                Some(mac) => own_mac != Some(mac),
                None => false,
            }
    })
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Sys(#[from] SysError),
    #[error("failed to open raw socket on {iface}: {source}")]
    RawSocket { iface: String, source: io::Error },
    #[error("interface transmit buffer is full")]
    TxBusy,
    #[error("failed to read the arp table: {0}")]
    ArpTable(#[from] procfs::ProcError),
    #[error(transparent)]
    Neigh(#[from] CommandError),
}

/// Asks whether some other station currently holds an address on an
/// interface. Implemented against kernel neighbour state; tests
/// substitute a fixed table.
pub trait OccupancyProbe: Send {
    fn is_occupied(&mut self, iface: &str, addr: &Address) -> Result<bool, ProbeError>;
}

enum Backend {
    /// IPv4: nudge with an unsolicited ARP request, then scan the
    /// kernel ARP table.
    Arp { socket: RawSocket },
    /// IPv6: snapshot `ip -6 neigh` each round. An empty cache counts
    /// as unoccupied until the kernel learns better.
    NeighbourTable { ip_tool: PathBuf },
}

/// The real probe behind the duplicate-address watcher.
pub struct NeighbourProbe {
    own_mac: [u8; 6],
    backend: Backend,
}

impl NeighbourProbe {
    pub fn new(iface: &str, addr: &Address) -> Result<Self, ProbeError> {
        let own_mac = sys::interface_mac(iface)?;
        let backend = if addr.is_ipv6() {
            Backend::NeighbourTable {
                ip_tool: sys::find_tool("ip")?,
            }
        } else {
            let socket =
                RawSocket::new(iface, Medium::Ethernet).map_err(|source| ProbeError::RawSocket {
                    iface: iface.to_owned(),
                    source,
                })?;
            Backend::Arp { socket }
        };
        Ok(NeighbourProbe { own_mac, backend })
    }
}

impl OccupancyProbe for NeighbourProbe {
    fn is_occupied(&mut self, iface: &str, addr: &Address) -> Result<bool, ProbeError> {
        match &mut self.backend {
            Backend::Arp { socket } => {
                let IpAddr::V4(target) = addr.ip() else {
                    return Ok(false);
                };
                send_arp_probe(socket, self.own_mac, target)?;
                let mut entries = Vec::new();
                for entry in procfs::net::arp()? {
                    let Some(mac) = entry.hw_address else { continue };
                    entries.push(NeighbourEntry {
                        ip: IpAddr::V4(entry.ip_address),
                        iface: entry.device,
                        lladdr: Some(mac),
                        state: NeighbourState::Reachable,
                    });
                }
                Ok(has_neighbour_ip(
                    iface,
                    &addr.ip(),
                    &entries,
                    Some(self.own_mac),
                ))
            }
            Backend::NeighbourTable { ip_tool } => {
                let entries = ipv6_neighbour_snapshot(ip_tool)?;
                Ok(has_neighbour_ip(
                    iface,
                    &addr.ip(),
                    &entries,
                    Some(self.own_mac),
                ))
            }
        }
    }
}

/// Broadcast "who has <target>?" with an unspecified sender address,
/// so the probe itself never claims the address.
fn arp_probe_frame(own_mac: [u8; 6], target: Ipv4Addr) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(own_mac),
        source_protocol_addr: Ipv4Addr::UNSPECIFIED,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target,
    };
    let mut buf = vec![0u8; EthernetFrame::<&[u8]>::header_len() + repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    frame.set_dst_addr(EthernetAddress::BROADCAST);
    frame.set_src_addr(EthernetAddress(own_mac));
    frame.set_ethertype(EthernetProtocol::Arp);
    repr.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
    buf
}

fn send_arp_probe(
    socket: &mut RawSocket,
    own_mac: [u8; 6],
    target: Ipv4Addr,
) -> Result<(), ProbeError> {
    let frame = arp_probe_frame(own_mac, target);
    debug!(address = %target, "sending arp probe");
    let token = socket
        .transmit(Instant::from_micros_const(0))
        .ok_or(ProbeError::TxBusy)?;
    token.consume(frame.len(), |buf| buf.copy_from_slice(&frame));
    Ok(())
}

/// Current IPv6 neighbour table as the watcher sees it.
pub fn ipv6_neighbour_snapshot(ip_tool: &Path) -> Result<Vec<NeighbourEntry>, ProbeError> {
    let output = sys::run_captured(ip_tool, &["-6", "neigh"])?;
    Ok(parse_neighbour_table(&output))
}
