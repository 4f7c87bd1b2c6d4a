use crate::addr::Address;
use crate::capture::{CaptureControl, EndReason};
use crate::guard::{Guard, GuardAction, GuardError};
use crate::neighbour::OccupancyProbe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How often the watcher asks whether a neighbour holds the address.
/// Guard release is observed within one interval.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Guard whose add action starts a background thread checking whether
/// another station already owns `addr` on `iface`, and whose del
/// action stops and joins it.
///
/// A positive probe breaks the associated capture with
/// `EndReason::DuplicateAddress` and ends the thread. Several watchers
/// may share one control; the first detection wins and the rest simply
/// observe the capture as already broken.
pub fn watcher_guard(
    iface: &str,
    addr: Address,
    control: Arc<CaptureControl>,
    probe: Box<dyn OccupancyProbe>,
) -> Result<Guard, GuardError> {
    watcher_guard_with_interval(iface, addr, control, probe, PROBE_INTERVAL)
}

pub fn watcher_guard_with_interval(
    iface: &str,
    addr: Address,
    control: Arc<CaptureControl>,
    probe: Box<dyn OccupancyProbe>,
    interval: Duration,
) -> Result<Guard, GuardError> {
    let label = format!("duplicate address watcher for {addr}");
    let iface = iface.to_owned();
    let mut probe = Some(probe);
    let mut worker: Option<(Arc<AtomicBool>, thread::JoinHandle<()>)> = None;
    Guard::engage(
        label,
        Box::new(move |action| {
            match action {
                GuardAction::Add => {
                    let Some(probe) = probe.take() else {
                        return Ok(());
                    };
                    let run = Arc::new(AtomicBool::new(true));
                    let handle = thread::spawn({
                        let iface = iface.clone();
                        let addr = addr.clone();
                        let control = Arc::clone(&control);
                        let run = Arc::clone(&run);
                        move || watch(&iface, &addr, &control, probe, &run, interval)
                    });
                    worker = Some((run, handle));
                }
                GuardAction::Del => {
                    if let Some((run, handle)) = worker.take() {
                        run.store(false, Ordering::SeqCst);
                        let _ = handle.join();
                    }
                }
            }
            Ok(())
        }),
    )
}

fn watch(
    iface: &str,
    addr: &Address,
    control: &CaptureControl,
    mut probe: Box<dyn OccupancyProbe>,
    run: &AtomicBool,
    interval: Duration,
) {
    debug!(address = %addr, iface, "watching for address duplication");
    while run.load(Ordering::SeqCst) && control.broken().is_none() {
        match probe.is_occupied(iface, addr) {
            Ok(true) => {
                warn!(address = %addr, iface, "address is already held by a neighbour");
                control.break_loop(EndReason::DuplicateAddress);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(address = %addr, error = %err, "occupancy probe failed, retrying")
            }
        }
        thread::sleep(interval);
    }
    debug!(address = %addr, "watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbour::ProbeError;
    use std::time::Instant;

    struct TableProbe {
        occupied: Vec<(&'static str, Address)>,
    }

    impl TableProbe {
        fn new(occupied: &[(&'static str, &str)]) -> Box<Self> {
            Box::new(TableProbe {
                occupied: occupied
                    .iter()
                    .map(|(iface, addr)| (*iface, addr.parse().unwrap()))
                    .collect(),
            })
        }
    }

    impl OccupancyProbe for TableProbe {
        fn is_occupied(&mut self, iface: &str, addr: &Address) -> Result<bool, ProbeError> {
            Ok(self
                .occupied
                .iter()
                .any(|(i, a)| *i == iface && a == addr))
        }
    }

    const OCCUPIED: [(&str, &str); 2] = [
        ("wlan0", "192.168.1.1/24"),
        ("wlan0", "2001:470:1f15:df3::1/64"),
    ];

    fn wait_for(control: &CaptureControl, reason: EndReason) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if control.reason() == reason {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn free_address_never_breaks_the_capture() {
        let control = CaptureControl::new();
        let mut guard = watcher_guard_with_interval(
            "eth0",
            "10.0.0.1/16".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        guard.release();
        assert_eq!(control.reason(), EndReason::Unset);
    }

    #[test]
    fn taken_ipv4_address_is_reported() {
        let control = CaptureControl::new();
        let mut guard = watcher_guard_with_interval(
            "wlan0",
            "192.168.1.1/24".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(wait_for(&control, EndReason::DuplicateAddress));
        guard.release();
        assert_eq!(control.reason(), EndReason::DuplicateAddress);
    }

    #[test]
    fn taken_ipv6_address_is_reported() {
        let control = CaptureControl::new();
        let mut guard = watcher_guard_with_interval(
            "wlan0",
            "2001:470:1f15:df3::1/64".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(wait_for(&control, EndReason::DuplicateAddress));
        guard.release();
    }

    #[test]
    fn same_address_elsewhere_is_not_a_duplicate() {
        let control = CaptureControl::new();
        let mut guard = watcher_guard_with_interval(
            "eth0",
            "192.168.1.1/24".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        guard.release();
        assert_eq!(control.reason(), EndReason::Unset);
    }

    #[test]
    fn dropping_the_guard_stops_the_thread() {
        let control = CaptureControl::new();
        let guard = watcher_guard_with_interval(
            "eth0",
            "10.0.0.1/16".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        drop(guard);
        assert_eq!(control.reason(), EndReason::Unset);
    }

    #[test]
    fn watchers_on_one_capture_compose() {
        let control = CaptureControl::new();
        let mut free = watcher_guard_with_interval(
            "eth0",
            "10.0.0.1/16".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        let mut taken = watcher_guard_with_interval(
            "wlan0",
            "192.168.1.1/24".parse().unwrap(),
            Arc::clone(&control),
            TableProbe::new(&OCCUPIED),
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(wait_for(&control, EndReason::DuplicateAddress));
        free.release();
        taken.release();
        assert_eq!(control.reason(), EndReason::DuplicateAddress);
    }
}
