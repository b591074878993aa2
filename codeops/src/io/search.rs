//! Ripgrep-backed snippet search over a checkout.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::text::truncate_chars;
use crate::io::config::SearchSettings;
use crate::io::process::run_command_with_timeout;

const RG_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub results: Vec<String>,
    pub truncated: bool,
}

/// Bounds for one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub max_results: usize,
    pub max_chars: usize,
    pub context_lines: usize,
}

impl From<&SearchSettings> for SearchLimits {
    fn from(settings: &SearchSettings) -> Self {
        Self {
            max_results: settings.max_results,
            max_chars: settings.max_chars,
            context_lines: settings.context_lines,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RgEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<RgMatch>,
}

#[derive(Debug, Deserialize)]
struct RgMatch {
    path: RgText,
    line_number: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RgText {
    text: String,
}

/// Search `repo_dir` for `query` (a ripgrep regex) and return numbered
/// snippets with `limits.context_lines` lines around each match.
///
/// An empty query returns no results without running ripgrep.
#[instrument(skip_all, fields(query = query, repo_dir = %repo_dir.display()))]
pub fn search_context(
    settings: &SearchSettings,
    repo_dir: &Path,
    query: &str,
    limits: SearchLimits,
) -> Result<SearchResult> {
    let mut result = SearchResult {
        query: query.to_string(),
        results: Vec::new(),
        truncated: false,
    };
    if query.trim().is_empty() {
        return Ok(result);
    }
    if !repo_dir.is_dir() {
        return Err(anyhow!("search directory {} does not exist", repo_dir.display()));
    }

    let mut cmd = Command::new(&settings.rg_bin);
    cmd.args(["--json", "-e", query, "."]).current_dir(repo_dir);
    let out = run_command_with_timeout(
        cmd,
        None,
        Duration::from_secs(settings.timeout_secs),
        RG_OUTPUT_LIMIT_BYTES,
    )
    .with_context(|| format!("run {}", settings.rg_bin))?;
    match out.status.code() {
        Some(0) | Some(1) => {}
        code => warn!(exit_code = ?code, stderr = %out.stderr_lossy().trim(), "ripgrep reported an error"),
    }

    let mut total = 0usize;
    for line in out.stdout_lossy().lines() {
        if result.results.len() >= limits.max_results || total >= limits.max_chars {
            result.truncated = true;
            break;
        }
        let Some((path, line_no)) = parse_match(line) else {
            continue;
        };
        let snippet = match snippet(repo_dir, &path, line_no, limits.context_lines) {
            Ok(snippet) => snippet,
            Err(err) => {
                warn!(path = %path, err = %err, "failed to read search hit");
                continue;
            }
        };
        let remaining = limits.max_chars - total;
        let snippet = if snippet.chars().count() > remaining {
            result.truncated = true;
            truncate_chars(&snippet, remaining, "")
        } else {
            snippet
        };
        total += snippet.chars().count();
        result.results.push(snippet);
        if result.truncated {
            break;
        }
    }
    debug!(hits = result.results.len(), truncated = result.truncated, "search finished");
    Ok(result)
}

/// `(path, line_number)` from one `rg --json` line, for `match` events only.
fn parse_match(line: &str) -> Option<(String, usize)> {
    let event: RgEvent = serde_json::from_str(line).ok()?;
    if event.kind != "match" {
        return None;
    }
    let data = event.data?;
    let path = data.path.text;
    let path = path.strip_prefix("./").unwrap_or(&path).to_string();
    Some((path, data.line_number?))
}

fn snippet(repo_dir: &Path, path: &str, line_no: usize, context_lines: usize) -> Result<String> {
    let bytes = fs::read(repo_dir.join(path)).with_context(|| format!("read {path}"))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let hit = line_no.saturating_sub(1);
    let start = hit.saturating_sub(context_lines);
    let end = (line_no + context_lines).min(lines.len());

    let mut out = vec![format!("# {path}")];
    for (idx, line) in lines.iter().enumerate().take(end).skip(start) {
        let marker = if idx == hit { '>' } else { ' ' };
        out.push(format!("{marker}{:>4}: {}", idx + 1, line.trim_end()));
    }
    Ok(out.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rg_available() -> bool {
        Command::new("rg").arg("--version").output().is_ok()
    }

    fn repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(
            temp.path().join("src/app.py"),
            "import os\n\ndef greet(name):\n    return f'hi {name}'\n\nprint(greet('x'))\n",
        )
        .expect("write");
        temp
    }

    #[test]
    fn parse_match_reads_match_events_only() {
        let begin = r#"{"type":"begin","data":{"path":{"text":"./a.py"}}}"#;
        let hit = r#"{"type":"match","data":{"path":{"text":"./src/a.py"},"lines":{"text":"x\n"},"line_number":3,"absolute_offset":0,"submatches":[]}}"#;
        assert_eq!(parse_match(begin), None);
        assert_eq!(parse_match("not json"), None);
        assert_eq!(parse_match(hit), Some(("src/a.py".to_string(), 3)));
    }

    #[test]
    fn snippet_marks_hit_line_with_context() {
        let temp = repo();
        let text = snippet(temp.path(), "src/app.py", 3, 1).expect("snippet");
        assert_eq!(
            text,
            "# src/app.py\n    2: \n>   3: def greet(name):\n    4:     return f'hi {name}'"
        );
    }

    #[test]
    fn snippet_clamps_at_file_edges() {
        let temp = repo();
        let text = snippet(temp.path(), "src/app.py", 1, 5).expect("snippet");
        assert!(text.starts_with("# src/app.py\n>   1: import os"));
        assert_eq!(text.lines().count(), 7);
    }

    #[test]
    fn empty_query_skips_search() {
        let temp = repo();
        let limits = SearchLimits::from(&SearchSettings::default());
        let settings = SearchSettings {
            rg_bin: "/definitely/missing/rg".to_string(),
            ..SearchSettings::default()
        };
        let result = search_context(&settings, temp.path(), "  ", limits).expect("search");
        assert!(result.results.is_empty());
        assert!(!result.truncated);
    }

    #[test]
    fn finds_matches_with_ripgrep() {
        if !rg_available() {
            return;
        }
        let temp = repo();
        let settings = SearchSettings::default();
        let result =
            search_context(&settings, temp.path(), "greet", SearchLimits::from(&settings))
                .expect("search");
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].contains(">   3: def greet(name):"));
    }

    #[test]
    fn results_are_capped() {
        if !rg_available() {
            return;
        }
        let temp = repo();
        let settings = SearchSettings::default();
        let limits = SearchLimits {
            max_results: 1,
            max_chars: 8000,
            context_lines: 0,
        };
        let result = search_context(&settings, temp.path(), "greet", limits).expect("search");
        assert_eq!(result.results.len(), 1);
        assert!(result.truncated);

        let tiny = SearchLimits {
            max_results: 10,
            max_chars: 10,
            context_lines: 0,
        };
        let result = search_context(&settings, temp.path(), "greet", tiny).expect("search");
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].chars().count(), 10);
        assert!(result.truncated);
    }
}
