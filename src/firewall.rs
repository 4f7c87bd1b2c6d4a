use crate::addr::Address;
use crate::guard::{Guard, GuardAction, GuardError, GuardStack};
use crate::sys;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

const TABLE: &str = "filter";
const INPUT: &str = "INPUT";
const OUTPUT: &str = "OUTPUT";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        })
    }
}

/// `icmp` and `icmpv6` differ in both the protocol and the type
/// parameter name.
fn icmp_name(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "icmp",
        IpAddr::V6(_) => "icmpv6",
    }
}

/// Rejects every inbound packet of one transport to the claimed
/// address, so no local service ever answers for the sleeping host.
pub fn reject_transport_rule(addr: &Address, transport: Transport) -> String {
    format!("-d {} -p {} -j REJECT", addr.pure(), transport)
}

/// Punches a hole above the blanket reject: SYNs to a watched port
/// must reach the capture.
pub fn accept_syn_rule(addr: &Address, port: u16) -> String {
    format!("-d {} -p tcp --syn --dport {} -j ACCEPT", addr.pure(), port)
}

/// Drops outbound RST|ACK from the claimed address. Not part of the
/// standard claim plan; the inbound REJECT already keeps the local
/// stack silent.
pub fn block_rst_rule(addr: &Address) -> String {
    format!(
        "-s {} -p tcp --tcp-flags ALL RST,ACK -j DROP",
        addr.pure()
    )
}

/// Keeps the proxy from telling the client its destination vanished
/// while the real host boots.
pub fn block_icmp_rule(client: &IpAddr) -> String {
    let icmp = icmp_name(client);
    format!(
        "-d {} -p {} --{}-type destination-unreachable -j DROP",
        client, icmp, icmp
    )
}

/// Guard around one firewall rule. The add action inserts at the top
/// of the chain, so later guards for the same address land in front of
/// earlier ones.
fn firewall_guard(v6: bool, chain: &'static str, rule: String) -> Result<Guard, GuardError> {
    let tables = iptables::new(v6).map_err(|err| GuardError::Firewall(err.to_string()))?;
    let label = format!("{} {} rule `{}`", tables.cmd, chain, rule);
    Guard::engage(
        label,
        Box::new(move |action| {
            match action {
                GuardAction::Add => tables.insert(TABLE, chain, &rule, 1),
                GuardAction::Del => tables.delete(TABLE, chain, &rule),
            }
            .map_err(|err| GuardError::Firewall(err.to_string()))
        }),
    )
}

/// Guard around `ip addr add|del <cidr> dev <iface>`.
fn assign_address_guard(ip_tool: &Path, iface: &str, cidr: String) -> Result<Guard, GuardError> {
    let label = format!("address {cidr} on {iface}");
    let ip_tool = ip_tool.to_owned();
    let iface = iface.to_owned();
    Guard::engage(
        label,
        Box::new(move |action| {
            let verb = match action {
                GuardAction::Add => "add",
                GuardAction::Del => "del",
            };
            sys::run_quiet(&ip_tool, &["addr", verb, &cidr, "dev", &iface])
                .map_err(GuardError::from)
        }),
    )
}

pub fn block_icmp_guard(client: &IpAddr) -> Result<Guard, GuardError> {
    firewall_guard(client.is_ipv6(), OUTPUT, block_icmp_rule(client))
}

pub fn block_rst_guard(addr: &Address) -> Result<Guard, GuardError> {
    firewall_guard(addr.is_ipv6(), OUTPUT, block_rst_rule(addr))
}

/// One step of the claim plan, in install order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClaimStep {
    InputRule { v6: bool, rule: String },
    AssignAddress { cidr: String },
}

/// The ordered claim plan for one emulation run. Per address: reject
/// TCP, reject UDP, accept each watched port, and only then assign the
/// address, so a freshly claimed address is never reachable without
/// its rules. Teardown happens in exact reverse.
pub fn claim_plan(addresses: &[Address], ports: &[u16]) -> Vec<ClaimStep> {
    let mut steps = Vec::new();
    for addr in addresses {
        let v6 = addr.is_ipv6();
        steps.push(ClaimStep::InputRule {
            v6,
            rule: reject_transport_rule(addr, Transport::Tcp),
        });
        steps.push(ClaimStep::InputRule {
            v6,
            rule: reject_transport_rule(addr, Transport::Udp),
        });
        for port in ports {
            steps.push(ClaimStep::InputRule {
                v6,
                rule: accept_syn_rule(addr, *port),
            });
        }
        steps.push(ClaimStep::AssignAddress { cidr: addr.cidr() });
    }
    steps
}

/// Installs the claim plan. A failing step rolls back every earlier
/// one before the error surfaces.
pub fn install_claims(
    ip_tool: &Path,
    iface: &str,
    addresses: &[Address],
    ports: &[u16],
) -> Result<GuardStack, GuardError> {
    let mut stack = GuardStack::new();
    for step in claim_plan(addresses, ports) {
        let guard = match step {
            ClaimStep::InputRule { v6, rule } => firewall_guard(v6, INPUT, rule)?,
            ClaimStep::AssignAddress { cidr } => assign_address_guard(ip_tool, iface, cidr)?,
        };
        stack.push(guard);
    }
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn input_rules_use_the_pure_address() {
        let a = addr("192.168.1.1/24");
        assert_eq!(
            reject_transport_rule(&a, Transport::Tcp),
            "-d 192.168.1.1 -p tcp -j REJECT"
        );
        assert_eq!(
            reject_transport_rule(&a, Transport::Udp),
            "-d 192.168.1.1 -p udp -j REJECT"
        );
        assert_eq!(
            accept_syn_rule(&a, 22),
            "-d 192.168.1.1 -p tcp --syn --dport 22 -j ACCEPT"
        );
        let ll = addr("fe80::1%eth0/64");
        assert_eq!(
            reject_transport_rule(&ll, Transport::Tcp),
            "-d fe80::1 -p tcp -j REJECT"
        );
    }

    #[test]
    fn rst_rule_matches_outbound_resets() {
        assert_eq!(
            block_rst_rule(&addr("192.168.1.1/24")),
            "-s 192.168.1.1 -p tcp --tcp-flags ALL RST,ACK -j DROP"
        );
    }

    #[test]
    fn icmp_rule_switches_name_per_family() {
        let v4: IpAddr = "198.51.100.5".parse().unwrap();
        assert_eq!(
            block_icmp_rule(&v4),
            "-d 198.51.100.5 -p icmp --icmp-type destination-unreachable -j DROP"
        );
        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        assert_eq!(
            block_icmp_rule(&v6),
            "-d 2001:db8::5 -p icmpv6 --icmpv6-type destination-unreachable -j DROP"
        );
    }

    #[test]
    fn plan_orders_rules_before_the_address() {
        let addresses = vec![addr("192.0.2.10/24"), addr("2001:db8::1/64")];
        let ports = vec![22, 80];
        let plan = claim_plan(&addresses, &ports);
        assert_eq!(plan.len(), 10);

        // every address assignment must come after all of its rules
        for (i, chunk) in plan.chunks(5).enumerate() {
            let v6 = i == 1;
            assert!(matches!(
                &chunk[0],
                ClaimStep::InputRule { v6: is_v6, rule } if *is_v6 == v6 && rule.contains("-p tcp -j REJECT")
            ));
            assert!(matches!(
                &chunk[1],
                ClaimStep::InputRule { rule, .. } if rule.contains("-p udp -j REJECT")
            ));
            assert!(matches!(
                &chunk[2],
                ClaimStep::InputRule { rule, .. } if rule.contains("--dport 22")
            ));
            assert!(matches!(
                &chunk[3],
                ClaimStep::InputRule { rule, .. } if rule.contains("--dport 80")
            ));
            assert!(matches!(&chunk[4], ClaimStep::AssignAddress { .. }));
        }
        assert_eq!(
            plan[4],
            ClaimStep::AssignAddress {
                cidr: "192.0.2.10/24".into()
            }
        );
        assert_eq!(
            plan[9],
            ClaimStep::AssignAddress {
                cidr: "2001:db8::1/64".into()
            }
        );
    }
}
