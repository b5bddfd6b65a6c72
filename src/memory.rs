//! Conversation memory across turns.
//!
//! Keeps the last few finished turns so the next request can be generated
//! with some history, and so `--nope` can re-run the previous request. The
//! memory is persisted as JSON beside the config file. Persistence problems
//! are logged and otherwise ignored; memory never fails a turn.

use crate::config::Config;
use crate::shell::ShellKind;
use crate::workflow::TurnReport;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MEMORY_FILE_NAME: &str = "conversation_memory.json";
const STDOUT_PREVIEW_CHARS: usize = 500;
const STDERR_PREVIEW_CHARS: usize = 200;
const ANALYSIS_PREVIEW_CHARS: usize = 200;

/// Source of timestamps, injectable for tests.
pub trait TimeProvider: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> u64;
}

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// One remembered turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: u64,
    pub request: String,
    pub command: Option<String>,
    pub shell: Option<ShellKind>,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout_preview: String,
    pub stderr_preview: String,
    #[serde(default)]
    pub analysis_preview: Option<String>,
    /// Why the turn ended without running anything, if it did.
    #[serde(default)]
    pub aborted: Option<String>,
}

impl ConversationEntry {
    pub fn from_report(report: &TurnReport, timestamp: u64) -> Self {
        let result = report.result();
        Self {
            timestamp,
            request: report.request.text().to_string(),
            command: report.command.as_ref().map(|c| c.text.clone()),
            shell: result.map(|r| r.shell),
            exit_code: result.map(|r| r.exit_code),
            success: report.succeeded(),
            stdout_preview: result
                .map(|r| truncate_chars(&r.stdout_text(), STDOUT_PREVIEW_CHARS))
                .unwrap_or_default(),
            stderr_preview: match (result, report.execution_failure()) {
                (Some(r), _) => truncate_chars(&r.stderr_text(), STDERR_PREVIEW_CHARS),
                (None, Some(failure)) => failure.to_string(),
                (None, None) => String::new(),
            },
            analysis_preview: report
                .analysis
                .as_ref()
                .and_then(|a| a.as_ref().ok())
                .map(|a| truncate_chars(&a.summary, ANALYSIS_PREVIEW_CHARS)),
            aborted: report.abort.as_ref().map(|reason| reason.to_string()),
        }
    }

    fn result_line(&self) -> String {
        match (&self.aborted, self.exit_code) {
            (Some(reason), _) => format!("Not executed ({})", reason),
            (None, Some(code)) if self.success => format!("Success (code {})", code),
            (None, Some(code)) => format!("Failed (code {})", code),
            (None, None) => "Not executed".to_string(),
        }
    }
}

pub struct ConversationMemory {
    entries: VecDeque<ConversationEntry>,
    capacity: usize,
    path: Option<PathBuf>,
    clock: Box<dyn TimeProvider>,
}

impl ConversationMemory {
    /// Memory that is never written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            path: None,
            clock: Box::new(SystemTimeProvider),
        }
    }

    /// Loads memory from `path`. A missing or unreadable file gives an empty memory.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let mut memory = Self::in_memory(capacity);

        match read_entries(&path) {
            Ok(entries) => {
                memory.entries = entries.into();
                memory.evict();
                debug!("Loaded {} remembered turns from {}", memory.entries.len(), path.display());
            }
            Err(e) => warn!("Could not load conversation memory from {}: {}", path.display(), e),
        }

        memory.path = Some(path);
        memory
    }

    /// Loads from the default location under the config directory.
    pub fn open_default(capacity: usize) -> Self {
        match Self::default_path() {
            Ok(path) => Self::load(path, capacity),
            Err(e) => {
                warn!("Conversation memory disabled: {}", e);
                Self::in_memory(capacity)
            }
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Config::get_config_dir()?.join(MEMORY_FILE_NAME))
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Box<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn record(&mut self, report: &TurnReport) {
        let entry = ConversationEntry::from_report(report, self.clock.now());
        self.push(entry);
    }

    pub fn push(&mut self, entry: ConversationEntry) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(entry);
        self.evict();
        self.persist();
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ConversationEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(path) = self.path.as_ref().filter(|p| p.exists()) {
            if let Err(e) = fs::remove_file(path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        info!("Conversation memory cleared");
    }

    /// Numbered listing for `--history` and `/history`.
    pub fn render_history_with_io<W: Write>(&self, output: &mut W) -> Result<()> {
        if self.is_empty() {
            writeln!(output, "No conversation history.")?;
            return Ok(());
        }

        writeln!(output, "Conversation history ({} turns):", self.len())?;
        for (i, entry) in self.entries().enumerate() {
            let status = match (&entry.aborted, entry.exit_code) {
                (Some(_), _) => "not run".to_string(),
                (None, Some(code)) => format!("exit {}", code),
                (None, None) => "no shell".to_string(),
            };
            writeln!(output, "{}. [{}] {}", i + 1, status, entry.request)?;
            if let Some(command) = &entry.command {
                writeln!(output, "   $ {}", command)?;
            }
        }
        Ok(())
    }

    /// History block for the generator prompt covering the last `count` turns.
    pub fn context_for_prompt(&self, count: usize) -> Option<String> {
        if count == 0 || self.is_empty() {
            return None;
        }

        let skip = self.len().saturating_sub(count);
        let mut context = String::from("Previous conversation history:\n");
        for (i, entry) in self.entries.iter().skip(skip).enumerate() {
            context.push_str(&format!("\n{}. User: {}\n", i + 1, entry.request));
            if let Some(command) = &entry.command {
                context.push_str(&format!("   Command: {}\n", command));
            }
            context.push_str(&format!("   Result: {}\n", entry.result_line()));
            if let Some(analysis) = &entry.analysis_preview {
                context.push_str(&format!("   Analysis: {}\n", analysis));
            }
        }
        Some(context)
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_entries(path, &self.entries) {
            warn!("Could not save conversation memory to {}: {}", path.display(), e);
        }
    }
}

fn read_entries(path: &Path) -> Result<Vec<ConversationEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_entries(path: &Path, entries: &VecDeque<ConversationEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(entries)?;
    fs::write(path, content)?;
    Ok(())
}

fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedClock(u64);

    impl TimeProvider for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    fn entry(request: &str, exit_code: Option<i32>) -> ConversationEntry {
        ConversationEntry {
            timestamp: 1,
            request: request.to_string(),
            command: exit_code.map(|_| format!("echo {}", request)),
            shell: exit_code.map(|_| ShellKind::Bash),
            exit_code,
            success: exit_code == Some(0),
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            analysis_preview: None,
            aborted: None,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut memory = ConversationMemory::in_memory(2);
        memory.push(entry("one", Some(0)));
        memory.push(entry("two", Some(0)));
        memory.push(entry("three", Some(1)));

        let requests: Vec<&str> = memory.entries().map(|e| e.request.as_str()).collect();
        assert_eq!(requests, vec!["two", "three"]);
        assert_eq!(memory.last().unwrap().request, "three");
    }

    #[test]
    fn test_zero_capacity_remembers_nothing() {
        let mut memory = ConversationMemory::in_memory(0);
        memory.push(entry("one", Some(0)));
        assert!(memory.is_empty());
        assert!(memory.context_for_prompt(3).is_none());
    }

    #[test]
    fn test_context_lists_recent_turns_in_order() {
        let mut memory = ConversationMemory::in_memory(5);
        memory.push(entry("old", Some(0)));
        memory.push(entry("list files", Some(0)));
        let mut failed = entry("read x", Some(1));
        failed.analysis_preview = Some("x is empty".to_string());
        memory.push(failed);

        let context = memory.context_for_prompt(2).unwrap();
        assert!(context.starts_with("Previous conversation history:\n"));
        assert!(!context.contains("old"));
        assert!(context.contains("1. User: list files\n   Command: echo list files\n   Result: Success (code 0)"));
        assert!(context.contains("2. User: read x"));
        assert!(context.contains("Result: Failed (code 1)"));
        assert!(context.contains("Analysis: x is empty"));
    }

    #[test]
    fn test_aborted_turn_is_described() {
        let mut memory = ConversationMemory::in_memory(5);
        let mut blocked = entry("wipe disk", None);
        blocked.aborted = Some("command blocked".to_string());
        memory.push(blocked);

        let context = memory.context_for_prompt(1).unwrap();
        assert!(context.contains("Result: Not executed (command blocked)"));
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory").join(MEMORY_FILE_NAME);

        let mut memory = ConversationMemory::load(&path, 3).with_clock(Box::new(FixedClock(42)));
        memory.push(entry("first", Some(0)));
        memory.push(entry("second", Some(2)));
        assert!(path.exists());

        let reloaded = ConversationMemory::load(&path, 3);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.last().unwrap().exit_code, Some(2));

        // A smaller capacity keeps the newest entries.
        let trimmed = ConversationMemory::load(&path, 1);
        assert_eq!(trimmed.last().unwrap().request, "second");
        assert_eq!(trimmed.len(), 1);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MEMORY_FILE_NAME);
        fs::write(&path, "{not json").unwrap();

        let mut memory = ConversationMemory::load(&path, 3);
        assert!(memory.is_empty());

        memory.push(entry("fresh", Some(0)));
        assert_eq!(ConversationMemory::load(&path, 3).len(), 1);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MEMORY_FILE_NAME);

        let mut memory = ConversationMemory::load(&path, 3);
        memory.push(entry("x", Some(0)));
        memory.clear();

        assert!(memory.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_history_listing() {
        let mut memory = ConversationMemory::in_memory(3);
        let mut output = Vec::new();
        memory.render_history_with_io(&mut output).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "No conversation history.\n");

        memory.push(entry("list files", Some(0)));
        memory.push(entry("nothing ran", None));
        let mut output = Vec::new();
        memory.render_history_with_io(&mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("1. [exit 0] list files\n   $ echo list files"));
        assert!(output.contains("2. [no shell] nothing ran"));
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("  ok \n", 10), "ok");
    }
}
