use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Directories searched for external tools, in order.
const TOOL_DIRS: [&str; 4] = ["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

#[derive(Debug, Error)]
pub enum SysError {
    #[error("unable to find {0} in /sbin, /usr/sbin, /bin or /usr/bin")]
    ToolNotFound(String),
    #[error("failed to read MAC address of {iface}: {source}")]
    MacLookup {
        iface: String,
        source: mac_address::MacAddressError,
    },
    #[error("interface {0} has no MAC address")]
    NoMac(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("command failed: `{command}` exited with {status}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
    },
    #[error("output of `{command}` is not utf-8")]
    Encoding { command: String },
}

/// Resolves an external tool to an absolute path the way the system
/// firewall scripts do, without consulting $PATH.
pub fn find_tool(name: &str) -> Result<PathBuf, SysError> {
    for dir in TOOL_DIRS {
        let candidate = Path::new(dir).join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(SysError::ToolNotFound(name.to_owned()))
}

fn render(program: &Path, args: &[&str]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs a tool with stdio sent to /dev/null and waits for it. A
/// non-zero exit is an error carrying the full command line.
pub fn run_quiet(program: &Path, args: &[&str]) -> Result<(), CommandError> {
    let command = render(program, args);
    debug!(command = %command, "running");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed { command, status })
    }
}

/// Runs a tool and collects its stdout. Non-zero exits are errors;
/// stderr is discarded.
pub fn run_captured(program: &Path, args: &[&str]) -> Result<String, CommandError> {
    let command = render(program, args);
    debug!(command = %command, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(CommandError::Failed {
            command,
            status: output.status,
        });
    }
    String::from_utf8(output.stdout).map_err(|_| CommandError::Encoding { command })
}

/// MAC address of a local interface.
pub fn interface_mac(iface: &str) -> Result<[u8; 6], SysError> {
    let mac = mac_address::mac_address_by_name(iface).map_err(|source| SysError::MacLookup {
        iface: iface.to_owned(),
        source,
    })?;
    mac.map(|m| m.bytes())
        .ok_or_else(|| SysError::NoMac(iface.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_common_tool() {
        // sh is present in at least one of the searched directories on
        // any Linux system this runs on
        let path = find_tool("sh").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn missing_tool_is_an_error() {
        assert!(find_tool("definitely-not-a-real-tool-name").is_err());
    }

    #[test]
    fn run_quiet_reports_exit_status() {
        let sh = find_tool("sh").unwrap();
        assert!(run_quiet(&sh, &["-c", "exit 0"]).is_ok());
        let err = run_quiet(&sh, &["-c", "exit 3"]).unwrap_err();
        match err {
            CommandError::Failed { command, .. } => assert!(command.contains("exit 3")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn run_captured_returns_stdout() {
        let sh = find_tool("sh").unwrap();
        let out = run_captured(&sh, &["-c", "echo hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
