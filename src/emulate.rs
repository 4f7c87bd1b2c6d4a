use crate::addr::{bindable_ip, Address};
use crate::capture::{self, Capture, CaptureError, EndReason};
use crate::config::HostConfig;
use crate::firewall;
use crate::frame::{CaughtConnection, SynCatcher};
use crate::guard::{GuardError, GuardStack};
use crate::neighbour::{NeighbourProbe, ProbeError};
use crate::signal;
use crate::sys::{self, SysError};
use crate::watcher;
use crate::wol::{self, WolError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum EmulateError {
    #[error(transparent)]
    Tool(#[from] SysError),
    #[error("failed to set up system state: {0}")]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("capture loop failed: {0}")]
    CaptureLoop(String),
    #[error("one of these ips is owned by another machine: {0}")]
    DuplicateAddress(String),
    #[error("received a termination signal while waiting for a connection")]
    Signalled,
    #[error("capture ended without a usable packet")]
    NothingCaught,
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("failed to send wake-on-lan packet: {0}")]
    Wol(#[from] WolError),
}

/// External tools one run needs, resolved before anything is claimed
/// so a missing binary can never strand half-installed state.
pub struct Tools {
    ip: PathBuf,
    ping: Option<PathBuf>,
    ping6: Option<PathBuf>,
}

impl Tools {
    pub fn resolve(addresses: &[Address]) -> Result<Self, SysError> {
        let ip = sys::find_tool("ip")?;
        let ping = if addresses.iter().any(|a| !a.is_ipv6()) {
            Some(sys::find_tool("ping")?)
        } else {
            None
        };
        let ping6 = if addresses.iter().any(Address::is_ipv6) {
            Some(sys::find_tool("ping6")?)
        } else {
            None
        };
        Ok(Tools { ip, ping, ping6 })
    }

    fn ping_tool(&self, destination: &IpAddr) -> Option<&Path> {
        match destination {
            IpAddr::V4(_) => self.ping.as_deref(),
            IpAddr::V6(_) => self.ping6.as_deref(),
        }
    }
}

/// Capture filter for the watched addresses and ports: any TCP packet
/// to one of the claimed addresses on one of the watched ports.
pub fn bpf_filter(addresses: &[Address], ports: &[u16]) -> String {
    let hosts = addresses
        .iter()
        .map(Address::pure)
        .collect::<Vec<_>>()
        .join(" or ");
    let ports = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" or ");
    format!("tcp and dst host ({hosts}) and dst port ({ports})")
}

fn join_addresses(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a finished capture loop onto the run's fate.
fn conclude(
    reason: EndReason,
    caught: Option<CaughtConnection>,
    addresses: &[Address],
    loop_error: Option<String>,
) -> Result<CaughtConnection, EmulateError> {
    match reason {
        EndReason::DuplicateAddress => {
            return Err(EmulateError::DuplicateAddress(join_addresses(addresses)))
        }
        EndReason::Signal => return Err(EmulateError::Signalled),
        EndReason::Error => {
            return Err(EmulateError::CaptureLoop(
                loop_error.unwrap_or_else(|| "no error recorded".to_owned()),
            ))
        }
        EndReason::Unset => warn!("capture loop ended without giving a reason"),
        EndReason::SinkComplete => {}
    }
    caught.ok_or(EmulateError::NothingCaught)
}

/// Blocks until a SYN for one of the claimed addresses arrives, or the
/// capture is broken by a watcher or a signal. The registry entry and
/// the per-address watchers live exactly as long as the loop.
fn wait_and_listen(config: &HostConfig) -> Result<CaughtConnection, EmulateError> {
    let mut capture = Capture::open("any")?;
    let filter = bpf_filter(&config.addresses, &config.ports);
    info!(filter = %filter, "listening");
    capture.set_filter(&filter)?;

    let control = capture.control();
    let mut session = GuardStack::new();
    session.push(capture::registry_guard(Arc::clone(&control))?);
    for addr in &config.addresses {
        let probe = NeighbourProbe::new(&config.interface, addr)?;
        session.push(watcher::watcher_guard(
            &config.interface,
            addr.clone(),
            Arc::clone(&control),
            Box::new(probe),
        )?);
    }

    let mut catcher = SynCatcher::new(capture.datalink());
    let reason = capture.run_loop(0, &mut catcher);
    session.release_all();

    let loop_error = capture.take_last_error().map(|err| err.to_string());
    conclude(reason, catcher.caught.take(), &config.addresses, loop_error)
}

/// Pings the destination until it answers, the tries run out, or a
/// signal arrives. Exhaustion is an outcome, not an error.
fn ping_and_wait(tools: &Tools, iface: &str, destination: &IpAddr, tries: u32) -> bool {
    let Some(ping) = tools.ping_tool(destination) else {
        error!(destination = %destination, "no ping tool resolved for this address family");
        return false;
    };
    let target = bindable_ip(iface, destination);
    info!(command = %format!("{} -c 1 {}", ping.display(), target), "waiting for the host");
    for _ in 0..tries {
        if signal::is_signalled() {
            break;
        }
        if sys::run_quiet(ping, &["-c", "1", &target]).is_ok() {
            return true;
        }
    }
    error!(
        address = %target,
        tries,
        "host did not answer any ping"
    );
    false
}

/// One full impersonate-and-wake run.
///
/// Claims the sleeping host's addresses behind freshly installed
/// firewall rules, waits for a client SYN, shields the client from
/// ICMP unreachables, gives the addresses back, wakes the host and
/// waits for it to answer. Every claimed piece of system state is
/// released in reverse order on every exit path.
pub fn emulate_host(config: &HostConfig) -> Result<bool, EmulateError> {
    signal::reset_signalled();
    let tools = Tools::resolve(&config.addresses)?;

    // firewall rules and addresses; rolls back by itself on failure
    let mut claims = firewall::install_claims(
        &tools.ip,
        &config.interface,
        &config.addresses,
        &config.ports,
    )?;

    let caught = wait_and_listen(config)?;
    info!(
        source = %caught.source,
        destination = %caught.destination,
        "got a connection attempt"
    );

    // the client must not learn that its destination is gone for a
    // moment, so swallow unreachables before the address goes away
    let _icmp_block = firewall::block_icmp_guard(&caught.source)?;

    // hand the addresses back; the waking host answers the retransmit
    claims.release_all();

    wol::send(&config.interface, config.mac)?;

    Ok(ping_and_wait(
        &tools,
        &config.interface,
        &caught.destination,
        config.ping_tries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addrs(list: &[&str]) -> Vec<Address> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn caught() -> CaughtConnection {
        CaughtConnection {
            frame: vec![0; 54],
            source: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 5)),
            destination: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
        }
    }

    #[test]
    fn filter_composes_hosts_and_ports() {
        let addresses = addrs(&["192.0.2.10/24", "2001:db8::1/64"]);
        assert_eq!(
            bpf_filter(&addresses, &[80, 443]),
            "tcp and dst host (192.0.2.10 or 2001:db8::1) and dst port (80 or 443)"
        );
    }

    #[test]
    fn filter_strips_zones_from_link_local_addresses() {
        let addresses = addrs(&["fe80::1%eth0/64"]);
        assert_eq!(
            bpf_filter(&addresses, &[22]),
            "tcp and dst host (fe80::1) and dst port (22)"
        );
    }

    #[test]
    fn sink_completion_yields_the_caught_connection() {
        let result = conclude(
            EndReason::SinkComplete,
            Some(caught()),
            &addrs(&["192.0.2.10/24"]),
            None,
        );
        assert_eq!(result.unwrap().destination.to_string(), "192.0.2.10");
    }

    #[test]
    fn duplicate_address_names_the_configured_addresses() {
        let err = conclude(
            EndReason::DuplicateAddress,
            None,
            &addrs(&["192.168.1.1/24", "2001:db8::1/64"]),
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("owned by another machine"));
        assert!(message.contains("192.168.1.1/24"));
        assert!(message.contains("2001:db8::1/64"));
    }

    #[test]
    fn signal_is_fatal() {
        assert!(matches!(
            conclude(
                EndReason::Signal,
                Some(caught()),
                &addrs(&["192.0.2.10/24"]),
                None
            ),
            Err(EmulateError::Signalled)
        ));
    }

    #[test]
    fn ending_empty_handed_is_fatal() {
        assert!(matches!(
            conclude(EndReason::Unset, None, &addrs(&["192.0.2.10/24"]), None),
            Err(EmulateError::NothingCaught)
        ));
    }

    #[test]
    fn loop_errors_carry_their_message() {
        let err = conclude(
            EndReason::Error,
            None,
            &addrs(&["192.0.2.10/24"]),
            Some("read failed".into()),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "capture loop failed: read failed");
    }
}
