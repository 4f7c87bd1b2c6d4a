use std::process::ExitStatus;
use thiserror::Error;
use tracing::{debug, error};

use crate::sys::CommandError;

/// Whether a guard action is acquiring or releasing its effect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardAction {
    Add,
    Del,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("command failed: `{command}` exited with {status}")]
    Command { command: String, status: ExitStatus },
    #[error("firewall error: {0}")]
    Firewall(String),
    #[error("capture registry is unavailable")]
    Registry,
}

impl From<CommandError> for GuardError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Spawn { command, source } => GuardError::Spawn { command, source },
            CommandError::Failed { command, status } => GuardError::Command { command, status },
            CommandError::Encoding { command } => GuardError::Firewall(command),
        }
    }
}

type Action = Box<dyn FnMut(GuardAction) -> Result<(), GuardError> + Send>;

/// One-shot owner of a reversible system effect.
///
/// Construction runs the add branch of the action; the effect exists
/// exactly while the guard is alive. Dropping the guard (or calling
/// `release`) runs the del branch once. A del failure is logged with
/// the guard's label and swallowed, so teardown of surrounding guards
/// always continues.
pub struct Guard {
    label: String,
    action: Option<Action>,
}

impl Guard {
    pub fn engage(
        label: impl Into<String>,
        mut action: Action,
    ) -> Result<Self, GuardError> {
        let label = label.into();
        action(GuardAction::Add)?;
        debug!(guard = %label, "engaged");
        Ok(Guard {
            label,
            action: Some(action),
        })
    }

    /// Runs the release action if it has not run yet.
    pub fn release(&mut self) {
        if let Some(mut action) = self.action.take() {
            debug!(guard = %self.label, "releasing");
            if let Err(err) = action(GuardAction::Del) {
                error!(
                    guard = %self.label,
                    error = %err,
                    "release failed, continuing teardown"
                );
            }
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Guards released in strict reverse insertion order.
///
/// `Vec<Guard>` alone drops front to back; claimed system state has to
/// unwind back to front, so the stack pops explicitly.
#[derive(Default)]
pub struct GuardStack {
    guards: Vec<Guard>,
}

impl GuardStack {
    pub fn new() -> Self {
        GuardStack::default()
    }

    pub fn push(&mut self, guard: Guard) {
        self.guards.push(guard);
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Releases everything now, newest first.
    pub fn release_all(&mut self) {
        while let Some(mut guard) = self.guards.pop() {
            guard.release();
        }
    }
}

impl Drop for GuardStack {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &str) -> Result<Guard, GuardError> {
        let log = Arc::clone(log);
        let name = name.to_owned();
        Guard::engage(
            name.clone(),
            Box::new(move |action| {
                let tag = match action {
                    GuardAction::Add => "add",
                    GuardAction::Del => "del",
                };
                log.lock().unwrap().push(format!("{tag} {name}"));
                Ok(())
            }),
        )
    }

    #[test]
    fn add_runs_on_engage_and_del_on_drop() {
        let log: Log = Default::default();
        {
            let _guard = recording(&log, "a").unwrap();
            assert_eq!(*log.lock().unwrap(), vec!["add a"]);
        }
        assert_eq!(*log.lock().unwrap(), vec!["add a", "del a"]);
    }

    #[test]
    fn release_runs_at_most_once() {
        let log: Log = Default::default();
        let mut guard = recording(&log, "a").unwrap();
        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(*log.lock().unwrap(), vec!["add a", "del a"]);
    }

    #[test]
    fn failed_engage_leaves_no_guard() {
        let result = Guard::engage(
            "broken",
            Box::new(|action| match action {
                GuardAction::Add => Err(GuardError::Firewall("no".into())),
                GuardAction::Del => panic!("del must not run after a failed add"),
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn stack_releases_in_reverse_insertion_order() {
        let log: Log = Default::default();
        {
            let mut stack = GuardStack::new();
            for name in ["a", "b", "c"] {
                stack.push(recording(&log, name).unwrap());
            }
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["add a", "add b", "add c", "del c", "del b", "del a"]
        );
    }

    #[test]
    fn explicit_release_then_drop_releases_once() {
        let log: Log = Default::default();
        let mut stack = GuardStack::new();
        stack.push(recording(&log, "a").unwrap());
        stack.push(recording(&log, "b").unwrap());
        stack.release_all();
        drop(stack);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["add a", "add b", "del b", "del a"]
        );
    }

    #[test]
    fn failed_release_does_not_stop_teardown() {
        let log: Log = Default::default();
        let mut stack = GuardStack::new();
        stack.push(recording(&log, "a").unwrap());
        {
            let log = Arc::clone(&log);
            stack.push(
                Guard::engage(
                    "flaky",
                    Box::new(move |action| match action {
                        GuardAction::Add => Ok(()),
                        GuardAction::Del => {
                            log.lock().unwrap().push("del flaky".into());
                            Err(GuardError::Firewall("ip addr del failed".into()))
                        }
                    }),
                )
                .unwrap(),
            );
        }
        drop(stack);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["add a", "del flaky", "del a"]
        );
    }

    #[test]
    fn partial_install_rolls_back_in_reverse() {
        let log: Log = Default::default();
        let build = || -> Result<GuardStack, GuardError> {
            let mut stack = GuardStack::new();
            stack.push(recording(&log, "a")?);
            stack.push(recording(&log, "b")?);
            stack.push(Guard::engage(
                "broken",
                Box::new(|_| Err(GuardError::Firewall("refused".into()))),
            )?);
            stack.push(recording(&log, "never")?);
            Ok(stack)
        };
        assert!(build().is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["add a", "add b", "del b", "del a"]
        );
    }
}
