use crate::frame::LinkType;
use crate::guard::{Guard, GuardAction, GuardError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error};

/// How long one blocking read may take before the loop re-checks its
/// break state. Break requests are observed within this bound.
const READ_TIMEOUT_MS: i32 = 250;

/// Why a capture loop ended. Ordered by precedence: when several break
/// requests race, the numerically larger reason survives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EndReason {
    Unset = 0,
    SinkComplete = 1,
    Signal = 2,
    DuplicateAddress = 3,
    Error = 4,
}

impl EndReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EndReason::SinkComplete,
            2 => EndReason::Signal,
            3 => EndReason::DuplicateAddress,
            4 => EndReason::Error,
            _ => EndReason::Unset,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EndReason::Unset => "unset",
            EndReason::SinkComplete => "sink complete",
            EndReason::Signal => "signal",
            EndReason::DuplicateAddress => "duplicate address",
            EndReason::Error => "error",
        })
    }
}

/// Shared break state of one capture loop. Watchers, the signal
/// bridge and the loop itself all talk to the loop through this; the
/// pcap handle never leaves the capturing thread.
#[derive(Debug, Default)]
pub struct CaptureControl {
    state: AtomicU8,
}

impl CaptureControl {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureControl::default())
    }

    /// Requests loop termination. Callable from any thread, any number
    /// of times; a lower-precedence reason never downgrades the state.
    pub fn break_loop(&self, reason: EndReason) {
        self.state.fetch_max(reason as u8, Ordering::SeqCst);
    }

    pub fn reason(&self) -> EndReason {
        EndReason::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn broken(&self) -> Option<EndReason> {
        match self.reason() {
            EndReason::Unset => None,
            reason => Some(reason),
        }
    }
}

/// What a sink tells the loop after each delivered frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkVerdict {
    Continue,
    Complete,
}

pub trait PacketSink {
    fn deliver(&mut self, data: &[u8]) -> SinkVerdict;
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture on {iface}: {source}")]
    Open { iface: String, source: pcap::Error },
    #[error("failed to install filter `{filter}`: {source}")]
    Filter { filter: String, source: pcap::Error },
}

/// Wrapper around a live pcap handle.
pub struct Capture {
    inner: pcap::Capture<pcap::Active>,
    control: Arc<CaptureControl>,
    datalink: LinkType,
    last_error: Option<pcap::Error>,
}

impl Capture {
    /// Attaches to a named interface, or to every interface via
    /// `"any"`. Named interfaces are opened promiscuous; the `any`
    /// pseudo-device does not support it.
    pub fn open(iface: &str) -> Result<Self, CaptureError> {
        let inactive = pcap::Capture::from_device(iface)
            .map_err(|source| CaptureError::Open {
                iface: iface.to_owned(),
                source,
            })?
            .promisc(iface != "any")
            .snaplen(65535)
            .immediate_mode(true)
            .timeout(READ_TIMEOUT_MS);
        let active = inactive.open().map_err(|source| CaptureError::Open {
            iface: iface.to_owned(),
            source,
        })?;
        let datalink = LinkType::from_dlt(active.get_datalink().0);
        Ok(Capture {
            inner: active,
            control: CaptureControl::new(),
            datalink,
            last_error: None,
        })
    }

    pub fn set_filter(&mut self, filter: &str) -> Result<(), CaptureError> {
        self.inner
            .filter(filter, true)
            .map_err(|source| CaptureError::Filter {
                filter: filter.to_owned(),
                source,
            })
    }

    pub fn datalink(&self) -> LinkType {
        self.datalink
    }

    /// Handle other threads use to break this loop.
    pub fn control(&self) -> Arc<CaptureControl> {
        Arc::clone(&self.control)
    }

    /// Error that made the loop end with `EndReason::Error`, if any.
    pub fn take_last_error(&mut self) -> Option<pcap::Error> {
        self.last_error.take()
    }

    /// Blocks delivering frames to the sink until the sink completes,
    /// someone breaks the loop, or `limit` frames have been delivered
    /// (0 means unbounded). Returns the winning termination reason.
    pub fn run_loop(&mut self, limit: usize, sink: &mut dyn PacketSink) -> EndReason {
        let mut delivered = 0usize;
        loop {
            if let Some(reason) = self.control.broken() {
                return reason;
            }
            match self.inner.next_packet() {
                Ok(packet) => {
                    if packet.data.is_empty() {
                        debug!("ignoring empty capture delivery");
                        continue;
                    }
                    delivered += 1;
                    if let SinkVerdict::Complete = sink.deliver(packet.data) {
                        self.control.break_loop(EndReason::SinkComplete);
                    } else if limit != 0 && delivered >= limit {
                        return self.control.reason();
                    }
                }
                // the read timeout is our dispatch boundary
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(source) => {
                    error!(error = %source, "capture read failed");
                    self.last_error = Some(source);
                    self.control.break_loop(EndReason::Error);
                }
            }
        }
    }
}

// Every live capture registers here so the signal handler can reach
// it. Only registry guards mutate the set.
static REGISTRY: Mutex<Vec<(u64, Arc<CaptureControl>)>> = Mutex::new(Vec::new());
static NEXT_ENTRY: AtomicU64 = AtomicU64::new(0);

/// Breaks every registered capture. Called from the signal handler, so
/// it must not allocate or log.
pub fn break_all(reason: EndReason) {
    if let Ok(registry) = REGISTRY.lock() {
        for (_, control) in registry.iter() {
            control.break_loop(reason);
        }
    }
}

/// Guard whose lifetime bounds a capture's visibility to the signal
/// bridge.
pub fn registry_guard(control: Arc<CaptureControl>) -> Result<Guard, GuardError> {
    let id = NEXT_ENTRY.fetch_add(1, Ordering::Relaxed);
    let mut slot = Some(control);
    Guard::engage(
        "capture registry entry",
        Box::new(move |action| {
            let mut registry = REGISTRY.lock().map_err(|_| GuardError::Registry)?;
            match action {
                GuardAction::Add => {
                    if let Some(control) = slot.take() {
                        registry.push((id, control));
                    }
                }
                GuardAction::Del => registry.retain(|(entry, _)| *entry != id),
            }
            Ok(())
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_sticks_unless_outranked() {
        let control = CaptureControl::new();
        assert_eq!(control.reason(), EndReason::Unset);
        control.break_loop(EndReason::SinkComplete);
        assert_eq!(control.reason(), EndReason::SinkComplete);
        // a later, weaker request is ignored
        control.break_loop(EndReason::SinkComplete);
        assert_eq!(control.reason(), EndReason::SinkComplete);
        // a stronger one wins
        control.break_loop(EndReason::Signal);
        assert_eq!(control.reason(), EndReason::Signal);
        control.break_loop(EndReason::SinkComplete);
        assert_eq!(control.reason(), EndReason::Signal);
    }

    #[test]
    fn duplicate_address_outranks_signal() {
        let control = CaptureControl::new();
        control.break_loop(EndReason::Signal);
        control.break_loop(EndReason::DuplicateAddress);
        assert_eq!(control.reason(), EndReason::DuplicateAddress);
        let control = CaptureControl::new();
        control.break_loop(EndReason::DuplicateAddress);
        control.break_loop(EndReason::Signal);
        assert_eq!(control.reason(), EndReason::DuplicateAddress);
    }

    #[test]
    fn break_all_reaches_registered_controls_only() {
        let registered = CaptureControl::new();
        let mut entry = registry_guard(Arc::clone(&registered)).unwrap();
        let unregistered = CaptureControl::new();

        break_all(EndReason::DuplicateAddress);
        assert_eq!(registered.reason(), EndReason::DuplicateAddress);
        assert_ne!(unregistered.reason(), EndReason::DuplicateAddress);

        // once the entry guard is released the control is unreachable
        entry.release();
        let late = CaptureControl::new();
        let mut late_entry = registry_guard(Arc::clone(&late)).unwrap();
        break_all(EndReason::Error);
        assert_eq!(registered.reason(), EndReason::DuplicateAddress);
        assert_eq!(late.reason(), EndReason::Error);
        late_entry.release();
    }
}
