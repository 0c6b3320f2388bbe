//! Whitelist + veto + syntax checks applied to every command, predefined
//! or ad-hoc, before it ever reaches the connection pool.

use once_cell_regex::VETO_PATTERNS;
use regex::Regex;

pub struct CommandCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl CommandCheckResult {
    fn ok() -> Self {
        CommandCheckResult {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        CommandCheckResult {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

const WHITELIST_STEMS: &[&str] = &[
    "uptime", "hostname", "uname", "lscpu", "lsmem", "lsblk", "free", "df", "ps", "ss", "ip",
    "iostat", "vmstat", "cat",
];

const SEPARATORS: &[char] = &[';', '&', '|', '`'];

/// `check_command` is pure and allocation-light so it can run per-command
/// on the executor's hot path without its own lock.
pub fn check_command(command: &str) -> CommandCheckResult {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return CommandCheckResult::reject("empty command");
    }

    if let Some(reason) = syntax_violation(trimmed) {
        return CommandCheckResult::reject(reason);
    }

    for pattern in VETO_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return CommandCheckResult::reject(format!("matches veto pattern: {}", pattern.as_str()));
        }
    }

    let mut tokens = trimmed.split_whitespace();
    let stem = match tokens.next() {
        Some(s) => s,
        None => return CommandCheckResult::reject("empty command"),
    };

    if !WHITELIST_STEMS.contains(&stem) {
        return CommandCheckResult::reject(format!("stem '{stem}' is not whitelisted"));
    }

    match stem {
        "cat" => {
            let path = tokens.next().unwrap_or("");
            if !(path.starts_with("/proc/") || path.starts_with("/sys/")) {
                return CommandCheckResult::reject("cat is restricted to /proc/ or /sys/ paths");
            }
        }
        "ip" => {
            let sub = tokens.next().unwrap_or("");
            if sub != "addr" && sub != "route" {
                return CommandCheckResult::reject("ip is restricted to 'addr' or 'route'");
            }
        }
        _ => {}
    }

    CommandCheckResult::ok()
}

/// Rejects separators, backticks, and command substitution outright,
/// independent of the veto regex list — these are never legitimate in a
/// single read-only diagnostic command.
fn syntax_violation(command: &str) -> Option<String> {
    if command.contains("$(") || command.contains('`') {
        return Some("command substitution is not permitted".into());
    }
    for sep in SEPARATORS {
        if command.contains(*sep) {
            return Some(format!("command separator '{sep}' is not permitted"));
        }
    }
    None
}

mod once_cell_regex {
    use super::*;
    use std::sync::OnceLock;

    pub struct LazyPatterns(OnceLock<Vec<Regex>>);

    impl LazyPatterns {
        pub fn iter(&self) -> std::slice::Iter<'_, Regex> {
            self.0.get_or_init(build_veto_patterns).iter()
        }
    }

    pub static VETO_PATTERNS: LazyPatterns = LazyPatterns(OnceLock::new());

    fn build_veto_patterns() -> Vec<Regex> {
        [
            r"rm\s+-rf",
            r"mkfs(\.\w+)?",
            r"dd\s+.*of=",
            r"\bshutdown\b",
            r"\breboot\b",
            r"chmod\s+777",
            r"iptables\s+-F",
            r"wget\s+.*\|\s*sh",
            r"curl\s+.*\|\s*sh",
            r">\s*/etc/",
            r"\bmkfs\b",
            r":(){:|:&};:",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("veto pattern must compile"))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_whitelisted_stems() {
        for cmd in [
            "uptime",
            "hostname",
            "uname -a",
            "lscpu",
            "free -b",
            "df -B1",
            "cat /proc/stat",
            "cat /sys/class/net/eth0/speed",
            "ip addr show",
            "ip route",
        ] {
            let result = check_command(cmd);
            assert!(result.allowed, "{cmd} should be allowed, reason={:?}", result.reason);
        }
    }

    #[test]
    fn rejects_non_whitelisted_stem() {
        assert!(!check_command("curl http://example.com").allowed);
    }

    #[test]
    fn rejects_cat_outside_proc_or_sys() {
        assert!(!check_command("cat /etc/passwd").allowed);
    }

    #[test]
    fn rejects_ip_with_unsupported_subcommand() {
        assert!(!check_command("ip link delete eth0").allowed);
    }

    #[test]
    fn rejects_destructive_veto_patterns() {
        for cmd in [
            "rm -rf /",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            "reboot",
            "chmod 777 /etc/shadow",
            "iptables -F",
            "wget http://x | sh",
        ] {
            assert!(!check_command(cmd).allowed, "{cmd} should be rejected");
        }
    }

    #[test]
    fn rejects_command_separators_and_substitution() {
        for cmd in [
            "uptime; rm -rf /",
            "uptime && rm -rf /",
            "uptime || true",
            "cat /proc/$(whoami)",
            "cat `whoami`",
        ] {
            assert!(!check_command(cmd).allowed, "{cmd} should be rejected");
        }
    }
}
