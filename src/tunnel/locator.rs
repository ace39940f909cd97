//! Find a running tunnel process by its identity tokens.

use tracing::debug;

use super::TunnelSpec;
use crate::process::{ProcessEntry, ProcessHost};

/// Pid of a live process whose arguments match `spec`, if any.
///
/// Candidates are narrowed to the client executable's name when the host can
/// list by name; otherwise every process is checked. A table that cannot be
/// read counts as "not found".
pub fn find_tunnel<H: ProcessHost + ?Sized>(host: &H, spec: &TunnelSpec) -> Option<u32> {
    let candidates = match host.processes_named(spec.process_name()) {
        Some(named) => named,
        None => host.processes(),
    };
    match candidates {
        Ok(entries) => first_match(&entries, spec),
        Err(e) => {
            debug!(error = %e, "process enumeration failed, treating tunnel as absent");
            None
        }
    }
}

fn first_match(entries: &[ProcessEntry], spec: &TunnelSpec) -> Option<u32> {
    entries
        .iter()
        .find(|p| !p.zombie && spec.matches(&p.args))
        .map(|p| p.pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spec, FakeHost};

    #[test]
    fn test_finds_matching_tunnel() {
        let host = FakeHost::default();
        let s = spec(42001, "fw1.example.net");
        host.insert("bash", &["bash", "-l"]);
        let pid = host.insert_invocation(&s.invocation());
        assert_eq!(find_tunnel(&host, &s), Some(pid));
    }

    #[test]
    fn test_ignores_other_tunnels() {
        let host = FakeHost::default();
        let ours = spec(42001, "fw1.example.net");
        host.insert_invocation(&spec(42002, "fw1.example.net").invocation());
        host.insert_invocation(&spec(42001, "fw2.example.net").invocation());
        assert_eq!(find_tunnel(&host, &ours), None);
    }

    #[test]
    fn test_name_filter_excludes_foreign_executables() {
        let host = FakeHost::default().with_name_lookup();
        let s = spec(42001, "fw1.example.net");
        let mut args = vec!["autossh".to_string()];
        args.extend(s.invocation().args);
        host.insert("autossh", &args.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(find_tunnel(&host, &s), None);
        let pid = host.insert_invocation(&s.invocation());
        assert_eq!(find_tunnel(&host, &s), Some(pid));
    }

    #[test]
    fn test_full_scan_without_name_lookup() {
        let host = FakeHost::default();
        let s = spec(42001, "fw1.example.net");
        let mut args = vec!["/opt/bin/ssh-wrapper".to_string()];
        args.extend(s.invocation().args);
        let pid = host.insert("ssh-wrapper", &args.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(find_tunnel(&host, &s), Some(pid));
    }

    #[test]
    fn test_enumeration_failure_is_not_found() {
        let host = FakeHost::default();
        let s = spec(42001, "fw1.example.net");
        host.insert_invocation(&s.invocation());
        host.fail_enumeration(true);
        assert_eq!(find_tunnel(&host, &s), None);
    }

    #[test]
    fn test_zombie_is_not_a_tunnel() {
        let host = FakeHost::default();
        let s = spec(42001, "fw1.example.net");
        let pid = host.insert_invocation(&s.invocation());
        host.mark_zombie(pid);
        assert_eq!(find_tunnel(&host, &s), None);
    }
}
