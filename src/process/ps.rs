//! Fallback process listing through `ps`.
//!
//! Used when the native process table comes back empty, which happens on
//! hosts where `/proc` is hidden (`hidepid`) or not mounted.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use super::ProcessEntry;

/// Run `ps` and parse its output into process entries.
pub fn snapshot() -> io::Result<Vec<ProcessEntry>> {
    let output = Command::new("ps")
        .args(["-axww", "-o", "pid=,args="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!("ps exited with {}", output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().filter_map(parse_line).collect())
}

/// Parse one `pid args...` line. Arguments are split on whitespace, so an
/// argument containing spaces becomes several tokens.
fn parse_line(line: &str) -> Option<ProcessEntry> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let args: Vec<String> = fields.map(String::from).collect();
    let program = args.first()?;
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
        .to_string();
    Some(ProcessEntry {
        pid,
        name,
        args,
        zombie: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_tunnel() {
        let line = "  4121 /usr/bin/ssh -N -i id_rsa -R 42001:localhost:3232 agent@fw1";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.pid, 4121);
        assert_eq!(entry.name, "ssh");
        assert_eq!(entry.args.len(), 7);
        assert_eq!(entry.args[5], "42001:localhost:3232");
    }

    #[test]
    fn test_parse_line_kernel_thread() {
        let entry = parse_line("    2 [kthreadd]").unwrap();
        assert_eq!(entry.name, "[kthreadd]");
    }

    #[test]
    fn test_parse_line_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("PID COMMAND").is_none());
        assert!(parse_line("  77").is_none());
    }
}
