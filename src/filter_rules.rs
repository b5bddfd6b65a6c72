//! Static rule table consulted by the command filter.
//!
//! Patterns are regular expressions matched case-insensitively against the
//! normalized command text (see [`crate::command_filter::normalize`]): quotes
//! and backticks removed, whitespace collapsed to single spaces.

use serde::Serialize;

/// How a rule match affects the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must be acknowledged before execution.
    Warned,
    /// Never executed.
    Blocked,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterRule {
    pub id: &'static str,
    pub pattern: &'static str,
    pub severity: Severity,
    pub description: &'static str,
}

const fn blocked(id: &'static str, pattern: &'static str, description: &'static str) -> FilterRule {
    FilterRule {
        id,
        pattern,
        severity: Severity::Blocked,
        description,
    }
}

const fn warned(id: &'static str, pattern: &'static str, description: &'static str) -> FilterRule {
    FilterRule {
        id,
        pattern,
        severity: Severity::Warned,
        description,
    }
}

/// Default rule table. Order within a severity is the match priority.
pub const DEFAULT_RULES: &[FilterRule] = &[
    // PowerShell
    blocked(
        "ps-recursive-force-delete",
        r"\b(remove-item|ri|rm|del|erase|rd|rmdir)\b.*(-recurse\b.*-force\b|-force\b.*-recurse\b)",
        "Recursive forced deletion (Remove-Item -Recurse -Force)",
    ),
    blocked(
        "ps-system-folder-delete",
        r"\bremove-item\b.*\\windows(\\|\s|$)",
        "Deletion inside the Windows system folder",
    ),
    blocked(
        "ps-drive-root-delete",
        r"\bremove-item\b.*\b[a-z]:\\(\*|\s|$)",
        "Deletion at the root of a drive",
    ),
    blocked("ps-format-volume", r"\bformat-volume\b", "Disk formatting (Format-Volume)"),
    blocked(
        "ps-power-state",
        r"\b(stop|restart)-computer\b",
        "Shutting down or restarting the computer",
    ),
    blocked(
        "ps-registry-hklm",
        r"\b(set|new|remove)-item(property)?\b.*\bhklm:?",
        "Machine-wide registry modification (HKLM)",
    ),
    blocked(
        "ps-invoke-expression",
        r"\binvoke-expression\b|(^|[\s;|(])iex(\s|$)",
        "Dynamic code execution (Invoke-Expression / iex)",
    ),
    blocked(
        "ps-elevation",
        r"\bstart-process\b.*-verb\s+runas\b",
        "Privilege elevation (Start-Process -Verb RunAs)",
    ),
    blocked(
        "ps-disable-defender",
        r"\bdisable-windowsdefender\b|\bset-mppreference\b.*-disable\w*\s+(\$true|1)",
        "Disabling Windows Defender protection",
    ),
    blocked(
        "ps-execution-policy-unrestricted",
        r"\bset-executionpolicy\b.*\b(unrestricted|bypass)\b",
        "Weakening the PowerShell execution policy",
    ),
    blocked(
        "ps-clear-recycle-bin-force",
        r"\bclear-recyclebin\b.*-force\b",
        "Emptying the recycle bin without confirmation",
    ),
    // cmd.exe
    blocked(
        "cmd-recursive-quiet-delete",
        r"\b(rd|rmdir|del|erase)\b.*(/s\b.*/q\b|/q\b.*/s\b)",
        "Recursive quiet deletion (/s /q)",
    ),
    blocked("cmd-format-drive", r"\bformat\s+[a-z]:", "Disk formatting (format X:)"),
    blocked(
        "cmd-registry-hklm",
        r"\breg\s+(add|delete)\s+hklm\b",
        "Machine-wide registry modification (reg HKLM)",
    ),
    // POSIX
    blocked(
        "posix-recursive-force-delete",
        // Flags are short-option clusters of rm's own letters, within one command segment.
        r"\brm\s+([^;&|]*\s)?(-[dfirv]*(r[dfirv]*f|f[dfirv]*r)[dfirv]*|(-[dfirv]*r[dfirv]*|--recursive)\s([^;&|]*\s)?(-[dfirv]*f[dfirv]*|--force)|(-[dfirv]*f[dfirv]*|--force)\s([^;&|]*\s)?(-[dfirv]*r[dfirv]*|--recursive))(\s|[;&|]|$)",
        "Recursive forced deletion (rm -rf)",
    ),
    blocked("posix-mkfs", r"\bmkfs(\.\w+)?\b", "Filesystem creation (mkfs)"),
    blocked(
        "posix-dd-device",
        r"\bdd\b.*\bof=/dev/",
        "Raw write to a block device (dd of=/dev/...)",
    ),
    blocked(
        "posix-device-overwrite",
        r">\s*/dev/(sd[a-z]|hd[a-z]|nvme\d|disk\d|mmcblk\d)",
        "Redirecting output onto a disk device",
    ),
    blocked(
        "posix-power-state",
        r"(^|[\s;&|])(shutdown|reboot|poweroff)(\s|$)|\binit\s+[06]\b",
        "Shutting down or rebooting the machine",
    ),
    blocked(
        "posix-fork-bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "Fork bomb",
    ),
    blocked(
        "posix-chmod-root",
        r"\bchmod\s+(-r\s+)?[0-7]*777\s+/(\s|$)",
        "World-writable permissions on the filesystem root",
    ),
    blocked(
        "posix-pipe-to-shell",
        r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
        "Piping downloaded content straight into a shell",
    ),
    // Warnings
    warned("ps-delete", r"\bremove-item\b", "File or folder deletion (Remove-Item)"),
    warned("ps-clear-recycle-bin", r"\bclear-recyclebin\b", "Recycle bin operation"),
    warned(
        "ps-firewall",
        r"\b(new|set|remove)-netfirewallrule\b|\bnetsh\s+advfirewall\b",
        "Firewall configuration change",
    ),
    warned(
        "ps-service",
        r"\b(set|stop|remove)-service\b|\bsc(\.exe)?\s+(stop|delete|config)\b",
        "Service modification",
    ),
    warned(
        "ps-stop-process",
        r"\bstop-process\b|\btaskkill\b",
        "Terminating processes",
    ),
    warned("ps-remove-computer", r"\bremove-computer\b", "Removing the computer from its domain"),
    warned("ps-disable-feature", r"\bdisable-\w+", "Disabling a system feature"),
    warned("cmd-delete", r"(^|[\s;&|])(del|erase|rd|rmdir)\s", "File or folder deletion (del/rd)"),
    warned("posix-delete", r"(^|[\s;&|])(rm|unlink|shred)\s", "File deletion (rm)"),
    warned("posix-kill", r"\b(kill|pkill|killall)\b", "Terminating processes"),
    warned(
        "posix-service",
        r"\bsystemctl\s+(stop|disable|mask|restart)\b|\bservice\s+\S+\s+stop\b",
        "Service modification",
    ),
    warned("posix-firewall", r"\b(iptables|nft|ufw)\b", "Firewall configuration change"),
    warned(
        "posix-recursive-permissions",
        r"\b(chmod|chown|chgrp)\s+(-\w*r\w*|--recursive)\b",
        "Recursive permission or ownership change",
    ),
    warned("posix-sudo", r"(^|[\s;&|])sudo\s", "Command runs with elevated privileges"),
    warned(
        "git-destructive",
        r"\bgit\s+(reset\s+--hard|clean\s+-\w*f|push\s+.*(--force|-f)\b)",
        "Destructive git operation",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rule_ids_are_unique() {
        let mut seen = HashSet::new();
        for rule in DEFAULT_RULES {
            assert!(seen.insert(rule.id), "duplicate rule id {}", rule.id);
        }
    }

    #[test]
    fn test_every_rule_compiles() {
        for rule in DEFAULT_RULES {
            assert!(
                regex::RegexBuilder::new(rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .is_ok(),
                "rule {} does not compile",
                rule.id
            );
        }
    }

    #[test]
    fn test_every_rule_has_description() {
        assert!(DEFAULT_RULES.iter().all(|r| !r.description.is_empty()));
    }

    #[test]
    fn test_table_has_both_severities() {
        assert!(DEFAULT_RULES.iter().any(|r| r.severity == Severity::Blocked));
        assert!(DEFAULT_RULES.iter().any(|r| r.severity == Severity::Warned));
    }
}
