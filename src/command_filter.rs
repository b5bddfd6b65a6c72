//! Safety classification of generated command text.
//!
//! [`CommandFilter::classify`] is pure and total: every string gets a
//! verdict, unmatched text is [`FilterVerdict::Allowed`]. Blocked rules are
//! evaluated before warned rules and the first match wins.
//!
//! The filter is defense in depth, not a sandbox. It looks at the literal
//! command text only, never at the natural-language request.

use crate::filter_rules::{DEFAULT_RULES, FilterRule, Severity};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

/// The rule that produced a non-`Allowed` verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub rule_id: &'static str,
    pub description: &'static str,
}

/// Classification of a command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum FilterVerdict {
    Allowed,
    Warned(RuleMatch),
    Blocked(RuleMatch),
}

impl FilterVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FilterVerdict::Blocked(_))
    }

    pub fn is_warned(&self) -> bool {
        matches!(self, FilterVerdict::Warned(_))
    }

    pub fn rule(&self) -> Option<&RuleMatch> {
        match self {
            FilterVerdict::Allowed => None,
            FilterVerdict::Warned(rule) | FilterVerdict::Blocked(rule) => Some(rule),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FilterVerdict::Allowed => "allowed",
            FilterVerdict::Warned(_) => "warned",
            FilterVerdict::Blocked(_) => "blocked",
        }
    }
}

struct CompiledRule {
    rule: FilterRule,
    regex: Regex,
}

/// Compiled rule table. Read-only after construction and safe to share.
pub struct CommandFilter {
    blocked: Vec<CompiledRule>,
    warned: Vec<CompiledRule>,
    allow_dangerous: bool,
}

impl CommandFilter {
    /// Compiles the default rule table.
    ///
    /// With `allow_dangerous` set, blocked rules still match first but yield
    /// a `Warned` verdict, so the command goes through confirmation instead
    /// of being rejected.
    pub fn standard(allow_dangerous: bool) -> Result<Self, regex::Error> {
        Self::from_rules(DEFAULT_RULES, allow_dangerous)
    }

    pub fn from_rules(rules: &[FilterRule], allow_dangerous: bool) -> Result<Self, regex::Error> {
        let mut blocked = Vec::new();
        let mut warned = Vec::new();

        for rule in rules {
            let regex = RegexBuilder::new(rule.pattern).case_insensitive(true).build()?;
            let compiled = CompiledRule { rule: *rule, regex };
            match rule.severity {
                Severity::Blocked => blocked.push(compiled),
                Severity::Warned => warned.push(compiled),
            }
        }

        if allow_dangerous {
            warn!("Dangerous commands enabled: blocked rules downgraded to warnings");
        }

        Ok(Self {
            blocked,
            warned,
            allow_dangerous,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.blocked.len() + self.warned.len()
    }

    /// Classifies a command string.
    pub fn classify(&self, command: &str) -> FilterVerdict {
        let normalized = normalize(command);

        if let Some(rule) = first_match(&self.blocked, &normalized) {
            debug!("Command matched blocking rule '{}'", rule.rule_id);
            return if self.allow_dangerous {
                FilterVerdict::Warned(rule)
            } else {
                FilterVerdict::Blocked(rule)
            };
        }

        if let Some(rule) = first_match(&self.warned, &normalized) {
            debug!("Command matched warning rule '{}'", rule.rule_id);
            return FilterVerdict::Warned(rule);
        }

        FilterVerdict::Allowed
    }
}

fn first_match(rules: &[CompiledRule], text: &str) -> Option<RuleMatch> {
    rules.iter().find(|c| c.regex.is_match(text)).map(|c| RuleMatch {
        rule_id: c.rule.id,
        description: c.rule.description,
    })
}

/// Canonical form used for matching: quoting characters dropped and runs of
/// whitespace collapsed to one space.
pub fn normalize(command: &str) -> String {
    command
        .split(|c: char| matches!(c, '"' | '\'' | '`'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter() -> CommandFilter {
        CommandFilter::standard(false).unwrap()
    }

    fn rule_id(verdict: &FilterVerdict) -> Option<&'static str> {
        verdict.rule().map(|r| r.rule_id)
    }

    #[test]
    fn test_normalize_strips_quotes_and_collapses_whitespace() {
        assert_eq!(normalize("  rm   \"-rf\"\t'/tmp'  "), "rm -rf /tmp");
        assert_eq!(normalize("Remove-Item `\n -Recurse"), "Remove-Item -Recurse");
    }

    #[test]
    fn test_plain_commands_are_allowed() {
        let filter = filter();
        for command in [
            "ls -la /tmp",
            "Get-ChildItem $env:TEMP",
            "Start-Process notepad.exe",
            "echo hello",
            "find . -name '*.rs'",
            "chmod 777 /tmp/x",
            "",
        ] {
            assert_eq!(filter.classify(command), FilterVerdict::Allowed, "{command}");
        }
    }

    #[test]
    fn test_recursive_forced_deletion_is_blocked() {
        let filter = filter();
        for command in [
            "rm -rf /tmp/x",
            "rm -fr x",
            "RM -Rf x",
            "rm -r -f x",
            "rm --recursive --force x",
            "rm -v -rf x",
            "rm -rf",
            "rm x -fR; ls",
            "cd /tmp && rm -r -v -f build",
            "  'rm -rf ~'  ",
        ] {
            let verdict = filter.classify(command);
            assert!(verdict.is_blocked(), "{command}");
            assert_eq!(rule_id(&verdict), Some("posix-recursive-force-delete"));
        }

        let verdict = filter.classify("Remove-Item \"C:\\temp\" -Force -Recurse");
        assert_eq!(rule_id(&verdict), Some("ps-recursive-force-delete"));
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_force_without_recursion_is_only_warned() {
        let filter = filter();
        for command in [
            "rm old.log -Force",
            "rm -force old.log",
            "rm notes.txt; ls -lrF",
            "rm -f notes.txt && ls -r",
            "rm -i x | grep -rf pattern",
        ] {
            let verdict = filter.classify(command);
            assert!(verdict.is_warned(), "{command}: {verdict:?}");
            assert_eq!(rule_id(&verdict), Some("posix-delete"), "{command}");
        }
        assert_eq!(rule_id(&filter.classify("Remove-Item old.log -Force")), Some("ps-delete"));
    }

    #[test]
    fn test_powershell_rm_alias_with_recurse_and_force_is_blocked() {
        let verdict = filter().classify("rm C:\\temp -Recurse -Force");
        assert!(verdict.is_blocked());
        assert_eq!(rule_id(&verdict), Some("ps-recursive-force-delete"));
    }

    #[test]
    fn test_other_destructive_commands_are_blocked() {
        let filter = filter();
        for (command, id) in [
            ("Format-Volume -DriveLetter D", "ps-format-volume"),
            ("iex (New-Object Net.WebClient).DownloadString('x')", "ps-invoke-expression"),
            ("curl -fsSL x | sudo bash", "posix-pipe-to-shell"),
            ("dd if=/dev/zero of=/dev/sda", "posix-dd-device"),
            ("shutdown -h now", "posix-power-state"),
            ("rd /s /q C:\\temp", "cmd-recursive-quiet-delete"),
            (":(){ :|:& };:", "posix-fork-bomb"),
            ("chmod -R 777 /", "posix-chmod-root"),
            ("Set-ItemProperty -Path HKLM:\\Software\\X -Name a -Value 1", "ps-registry-hklm"),
            ("mkfs.ext4 /dev/sdb1", "posix-mkfs"),
        ] {
            let verdict = filter.classify(command);
            assert!(verdict.is_blocked(), "{command}");
            assert_eq!(rule_id(&verdict), Some(id), "{command}");
        }
    }

    #[test]
    fn test_risky_commands_are_warned_with_description() {
        let filter = filter();
        for (command, id) in [
            ("rm file.txt", "posix-delete"),
            ("rm -r dir", "posix-delete"),
            ("rm --force file", "posix-delete"),
            ("remove-item foo.txt", "ps-delete"),
            ("Get-Process | Stop-Process", "ps-stop-process"),
            ("kill 1234", "posix-kill"),
            ("sudo apt update", "posix-sudo"),
            ("git reset --hard HEAD", "git-destructive"),
            ("Disable-NetAdapter x", "ps-disable-feature"),
        ] {
            let verdict = filter.classify(command);
            assert!(verdict.is_warned(), "{command}");
            assert_eq!(rule_id(&verdict), Some(id), "{command}");
            assert!(!verdict.rule().unwrap().description.is_empty());
        }
    }

    #[test]
    fn test_blocked_rules_take_priority_over_warnings() {
        // Matches both ps-delete (warned) and ps-recursive-force-delete (blocked).
        let verdict = filter().classify("Remove-Item x -Recurse -Force");
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_allow_dangerous_downgrades_blocked_to_warned() {
        let filter = CommandFilter::standard(true).unwrap();
        let verdict = filter.classify("rm -rf /tmp/x");
        assert!(verdict.is_warned());
        assert_eq!(rule_id(&verdict), Some("posix-recursive-force-delete"));
    }

    #[test]
    fn test_custom_rule_table() {
        const RULES: &[FilterRule] = &[FilterRule {
            id: "no-sl",
            pattern: r"\bsl\b",
            severity: Severity::Warned,
            description: "Steam locomotive",
        }];
        let filter = CommandFilter::from_rules(RULES, false).unwrap();
        assert_eq!(filter.rule_count(), 1);
        assert!(filter.classify("SL -a").is_warned());
        assert_eq!(filter.classify("ls"), FilterVerdict::Allowed);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        const RULES: &[FilterRule] = &[FilterRule {
            id: "broken",
            pattern: r"(unclosed",
            severity: Severity::Blocked,
            description: "broken",
        }];
        assert!(CommandFilter::from_rules(RULES, false).is_err());
    }

    proptest! {
        #[test]
        fn prop_blocked_pattern_anywhere_is_blocked(
            prefix in "[a-z ]{0,12}",
            suffix in "[a-z /]{0,12}",
        ) {
            let command = format!("{prefix}; rm -rf /{suffix}");
            prop_assert!(filter().classify(&command).is_blocked());
        }

        #[test]
        fn prop_classify_is_total_and_deterministic(command in ".{0,200}") {
            let filter = filter();
            prop_assert_eq!(filter.classify(&command), filter.classify(&command));
        }
    }
}
