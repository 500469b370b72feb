//! Usage telemetry: token counts per worker session, polled by the presence
//! sweep.
//!
//! Claude Code appends every API turn (with its `usage` block) to
//! `~/.claude/projects/<encoded-cwd>/<session_id>.jsonl`. Summing those blocks
//! gives the running totals the state machine compares against its baseline.

use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::TokenCounts;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::driver::CLAUDE_KIND;

pub trait UsageTelemetry: Send + Sync {
    /// Whether this source ever reports for the backend. Processes of
    /// unsupported backends advance on stdout activity instead.
    fn supports(&self, driver_kind: &str) -> bool;

    /// Totals for the session so far, or None when nothing is known yet.
    fn token_counts(&self, driver_kind: &str, session_id: &str) -> Option<TokenCounts>;
}

static RE_INPUT_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""input_tokens":\s*(\d+)"#).expect("input regex"));
static RE_OUTPUT_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""output_tokens":\s*(\d+)"#).expect("output regex"));
static RE_CACHE_READ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""cache_read_input_tokens":\s*(\d+)"#).expect("cache regex"));
static RE_CACHE_CREATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""cache_creation_input_tokens":\s*(\d+)"#).expect("cache create regex")
});

/// Sums token usage from a transcript. Cache reads and writes count as input.
pub fn parse_token_counts(content: &str) -> TokenCounts {
    let sum = |re: &Regex| -> u64 {
        re.captures_iter(content)
            .filter_map(|cap| cap[1].parse::<u64>().ok())
            .sum()
    };
    TokenCounts {
        input: sum(&RE_INPUT_TOKENS) + sum(&RE_CACHE_READ) + sum(&RE_CACHE_CREATE),
        output: sum(&RE_OUTPUT_TOKENS),
    }
}

#[derive(Clone)]
struct CachedTranscript {
    path: PathBuf,
    size: u64,
    mtime: Option<SystemTime>,
    counts: TokenCounts,
}

/// Reads Claude Code transcripts, re-parsing only when a file's size or
/// mtime changed.
pub struct TranscriptTelemetry {
    projects_dir: PathBuf,
    cache: Mutex<HashMap<String, CachedTranscript>>,
}

impl TranscriptTelemetry {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self {
            projects_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_home() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".claude").join("projects")))
    }

    fn locate(&self, session_id: &str) -> Option<PathBuf> {
        let file_name = format!("{}.jsonl", session_id);
        WalkDir::new(&self.projects_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| {
                entry.file_type().is_file() && entry.file_name().to_str() == Some(&file_name)
            })
            .map(|entry| entry.into_path())
    }

    fn read(&self, session_id: &str, path: &Path) -> Option<TokenCounts> {
        let metadata = fs_err::metadata(path).ok()?;
        let size = metadata.len();
        let mtime = metadata.modified().ok();

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = cache.get(session_id) {
            if cached.path == path && cached.size == size && cached.mtime == mtime {
                return Some(cached.counts);
            }
        }

        let content = fs_err::read_to_string(path).ok()?;
        let counts = parse_token_counts(&content);
        cache.insert(
            session_id.to_string(),
            CachedTranscript {
                path: path.to_path_buf(),
                size,
                mtime,
                counts,
            },
        );
        Some(counts)
    }
}

impl UsageTelemetry for TranscriptTelemetry {
    fn supports(&self, driver_kind: &str) -> bool {
        driver_kind == CLAUDE_KIND
    }

    fn token_counts(&self, driver_kind: &str, session_id: &str) -> Option<TokenCounts> {
        if !self.supports(driver_kind) || session_id.trim().is_empty() {
            return None;
        }
        let cached_path = {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.get(session_id).map(|cached| cached.path.clone())
        };
        let path = match cached_path {
            Some(path) if path.exists() => path,
            _ => self.locate(session_id)?,
        };
        self.read(session_id, &path)
    }
}

/// Telemetry for backends that expose none. The state machine then relies on
/// I/O activity and timers alone.
pub struct NoTelemetry;

impl UsageTelemetry for NoTelemetry {
    fn supports(&self, _driver_kind: &str) -> bool {
        false
    }

    fn token_counts(&self, _driver_kind: &str, _session_id: &str) -> Option<TokenCounts> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = r#"{"type":"user","message":{"role":"user","content":"hi"}}
{"type":"assistant","message":{"usage":{"input_tokens":10,"cache_read_input_tokens":90,"output_tokens":20}}}
{"type":"assistant","message":{"usage":{"input_tokens":5,"cache_creation_input_tokens":5,"output_tokens":30}}}
"#;

    #[test]
    fn parses_usage_blocks() {
        let counts = parse_token_counts(TRANSCRIPT);
        assert_eq!(counts.input, 110);
        assert_eq!(counts.output, 50);
    }

    #[test]
    fn finds_transcript_by_session_and_refreshes_on_change() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let project = temp_dir.path().join("-repo-app");
        fs_err::create_dir_all(&project).expect("project dir");
        let file = project.join("sess-1.jsonl");
        fs_err::write(&file, TRANSCRIPT).expect("write transcript");

        let telemetry = TranscriptTelemetry::new(temp_dir.path().to_path_buf());
        let first = telemetry.token_counts("claude", "sess-1").expect("counts");
        assert_eq!(first.output, 50);

        let mut grown = TRANSCRIPT.to_string();
        grown.push_str(
            "{\"type\":\"assistant\",\"message\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":7}}}\n",
        );
        fs_err::write(&file, grown).expect("append");
        let second = telemetry.token_counts("claude", "sess-1").expect("counts");
        assert_eq!(second.output, 57);
    }

    #[test]
    fn other_drivers_and_unknown_sessions_report_nothing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let telemetry = TranscriptTelemetry::new(temp_dir.path().to_path_buf());
        assert!(telemetry.token_counts("claude", "missing").is_none());
        assert!(telemetry.token_counts("codex", "sess-1").is_none());
        assert!(NoTelemetry.token_counts("claude", "sess-1").is_none());
        assert!(telemetry.supports("claude"));
        assert!(!NoTelemetry.supports("claude"));
    }
}
