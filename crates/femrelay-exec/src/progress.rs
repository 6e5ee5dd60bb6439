//! Progress extraction from solver output.
//!
//! The analysis script forwards solver log lines. Two shapes are recognized:
//! a percentage (`42%`, `Progress: 12.5 %`) and Abaqus status lines of the
//! form `STEP 2 INCREMENT 17`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid percent regex"));

static STEP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSTEP\s+(\d+)\s+INCREMENT\s+(\d+)").expect("valid step regex")
});

/// Progress reported by a running analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// 0.0 to 100.0
    pub percent: Option<f64>,
    pub step: Option<u32>,
    pub increment: Option<u32>,
    /// The line the progress was read from
    pub message: String,
}

/// Parse one output line. Returns None if it carries no progress.
pub fn parse_progress(line: &str) -> Option<Progress> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let percent = PERCENT_RE
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok())
        .filter(|p| (0.0..=100.0).contains(p));

    let (step, increment) = match STEP_RE.captures(line) {
        Some(c) => (c[1].parse().ok(), c[2].parse().ok()),
        None => (None, None),
    };

    if percent.is_none() && step.is_none() {
        return None;
    }

    Some(Progress {
        percent,
        step,
        increment,
        message: line.to_string(),
    })
}

/// Reassembles lines from arbitrarily split output chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    /// Feed a chunk, getting back every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// The trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percentage() {
        let progress = parse_progress("Progress: 42.5 %").unwrap();
        assert_eq!(progress.percent, Some(42.5));
        assert!(progress.step.is_none());

        // Out of range values are not progress
        assert!(parse_progress("load factor 250%").is_none());
    }

    #[test]
    fn test_parse_step_increment() {
        let progress = parse_progress("  STEP 2 INCREMENT 17 COMPLETED").unwrap();
        assert_eq!(progress.step, Some(2));
        assert_eq!(progress.increment, Some(17));
        assert_eq!(progress.message, "STEP 2 INCREMENT 17 COMPLETED");
    }

    #[test]
    fn test_plain_lines_are_ignored() {
        assert!(parse_progress("Begin Abaqus/Standard Analysis").is_none());
        assert!(parse_progress("").is_none());
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push("STEP 1 INCR").is_empty());
        assert_eq!(
            splitter.push("EMENT 3\r\n50%\npart"),
            vec!["STEP 1 INCREMENT 3", "50%"]
        );
        assert_eq!(splitter.finish().as_deref(), Some("part"));
        assert!(splitter.finish().is_none());
    }
}
