//! Whitespace minimizer addon — shrinks prompts to save input tokens.
//!
//! Collapses space runs, converts tabs, bounds consecutive newlines and
//! strips trailing whitespace from lines, while leaving fenced code blocks
//! and inline code spans byte-for-byte untouched. Rewrites flow onward as
//! `Continue`, so an addon later in the chain (the cache in particular)
//! observes the minimized prompt.

use async_trait::async_trait;
use costrail_core::addon::{Addon, AddonContext, PreRequestOutcome};
use costrail_core::error::AddonError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Minimizes whitespace in prompts before they reach the provider.
pub struct WhitespaceMinimizerAddon {
    minimize_spaces: bool,
    minimize_tabs: bool,
    minimize_newlines: bool,
    preserve_code_blocks: bool,
    aggressive: bool,
    max_newlines: usize,
    requests: AtomicU64,
    chars_removed: AtomicU64,
    tokens_saved: AtomicU64,
    enabled: AtomicBool,
}

impl Default for WhitespaceMinimizerAddon {
    fn default() -> Self {
        Self::new()
    }
}

impl WhitespaceMinimizerAddon {
    /// Defaults: collapse spaces and tabs, allow at most 2 consecutive
    /// newlines, preserve code blocks.
    pub fn new() -> Self {
        Self {
            minimize_spaces: true,
            minimize_tabs: true,
            minimize_newlines: true,
            preserve_code_blocks: true,
            aggressive: false,
            max_newlines: 2,
            requests: AtomicU64::new(0),
            chars_removed: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn with_max_newlines(mut self, max: usize) -> Self {
        self.max_newlines = max.max(1);
        self
    }

    /// Maximum compression: single newlines only, outer newlines trimmed.
    pub fn aggressive(mut self) -> Self {
        self.aggressive = true;
        self
    }

    pub fn without_code_block_preservation(mut self) -> Self {
        self.preserve_code_blocks = false;
        self
    }

    pub fn keep_spaces(mut self) -> Self {
        self.minimize_spaces = false;
        self
    }

    pub fn keep_tabs(mut self) -> Self {
        self.minimize_tabs = false;
        self
    }

    pub fn keep_newlines(mut self) -> Self {
        self.minimize_newlines = false;
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    fn effective_max_newlines(&self) -> usize {
        if self.aggressive { 1 } else { self.max_newlines }
    }

    /// Byte ranges that must pass through untouched: fenced ``` blocks
    /// (fence markers included) and inline `code` spans outside them.
    fn protected_ranges(text: &str) -> Vec<(usize, usize)> {
        // Fenced blocks: pair up ``` markers; an unclosed fence protects
        // everything to the end of the text.
        let fences: Vec<usize> = text.match_indices("```").map(|(i, _)| i).collect();
        let mut fence_ranges: Vec<(usize, usize)> = Vec::new();
        let mut f = 0;
        while f < fences.len() {
            let start = fences[f];
            let end = if f + 1 < fences.len() {
                fences[f + 1] + 3
            } else {
                text.len()
            };
            fence_ranges.push((start, end));
            f += 2;
        }

        // Inline code: backtick pairs on a single line, outside fences.
        let in_fence = |pos: usize| fence_ranges.iter().any(|&(s, e)| pos >= s && pos < e);
        let bytes = text.as_bytes();
        let mut inline_ranges: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'`' && !in_fence(i) {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != b'`' && bytes[j] != b'\n' {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b'`' && j > i + 1 {
                    inline_ranges.push((i, j + 1));
                    i = j + 1;
                    continue;
                }
            }
            i += 1;
        }

        let mut ranges = fence_ranges;
        ranges.extend(inline_ranges);
        ranges.sort_by_key(|&(s, _)| s);

        // Merge overlaps
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    fn minimize(&self, text: &str, ranges: &[(usize, usize)]) -> String {
        let in_range =
            |pos: usize| ranges.iter().any(|&(s, e)| pos >= s && pos < e);

        let chars: Vec<(usize, char)> = text.char_indices().collect();
        // Each output char tagged with whether it came from a protected span,
        // so trailing-whitespace stripping cannot reach into code blocks.
        let mut out: Vec<(char, bool)> = Vec::with_capacity(chars.len());

        let strip_trailing = |out: &mut Vec<(char, bool)>| {
            while matches!(out.last(), Some(&(c, false)) if c == ' ' || c == '\t') {
                out.pop();
            }
        };

        let collapses = |ch: char| {
            (ch == ' ' && self.minimize_spaces) || (ch == '\t' && self.minimize_tabs)
        };

        let mut i = 0;
        while i < chars.len() {
            let (pos, ch) = chars[i];

            if in_range(pos) {
                out.push((ch, true));
                i += 1;
                continue;
            }

            if collapses(ch) {
                out.push((' ', false));
                while i + 1 < chars.len()
                    && !in_range(chars[i + 1].0)
                    && collapses(chars[i + 1].1)
                {
                    i += 1;
                }
                i += 1;
            } else if ch == '\n' && self.minimize_newlines {
                let mut run = 1;
                while i + run < chars.len()
                    && chars[i + run].1 == '\n'
                    && !in_range(chars[i + run].0)
                {
                    run += 1;
                }
                if self.minimize_spaces {
                    strip_trailing(&mut out);
                }
                for _ in 0..run.min(self.effective_max_newlines()) {
                    out.push(('\n', false));
                }
                i += run;
            } else {
                out.push((ch, false));
                i += 1;
            }
        }

        if self.minimize_spaces {
            strip_trailing(&mut out);
        }
        if self.aggressive {
            while matches!(out.first(), Some(&('\n', false))) {
                out.remove(0);
            }
            while matches!(out.last(), Some(&('\n', false))) {
                out.pop();
            }
        }

        out.into_iter().map(|(c, _)| c).collect()
    }

    /// Minimization statistics since creation.
    pub fn stats(&self) -> MinimizerStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let chars = self.chars_removed.load(Ordering::Relaxed);
        let tokens = self.tokens_saved.load(Ordering::Relaxed);
        MinimizerStats {
            requests_minimized: requests,
            chars_removed: chars,
            tokens_saved: tokens,
            average_chars_per_request: if requests > 0 {
                chars as f64 / requests as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.chars_removed.store(0, Ordering::Relaxed);
        self.tokens_saved.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl Addon for WhitespaceMinimizerAddon {
    fn name(&self) -> &str {
        "whitespace_minimizer"
    }

    fn description(&self) -> String {
        let mut features = Vec::new();
        if self.minimize_spaces {
            features.push("spaces");
        }
        if self.minimize_tabs {
            features.push("tabs");
        }
        if self.minimize_newlines {
            features.push("newlines");
        }
        let mut desc = format!("Minimizes {}", features.join("/"));
        if self.preserve_code_blocks {
            desc.push_str(" (preserves code blocks)");
        }
        if self.aggressive {
            desc.push_str(" (aggressive)");
        }
        desc
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn pre_request(
        &self,
        prompt: &str,
        ctx: &mut AddonContext,
    ) -> Result<PreRequestOutcome, AddonError> {
        if prompt.is_empty() {
            return Ok(PreRequestOutcome::Unchanged);
        }

        let ranges = if self.preserve_code_blocks {
            Self::protected_ranges(prompt)
        } else {
            Vec::new()
        };

        let minimized = self.minimize(prompt, &ranges);
        if minimized == prompt {
            return Ok(PreRequestOutcome::Unchanged);
        }

        let chars_removed = (prompt.len() - minimized.len()) as u64;
        let tokens_saved = chars_removed / 4;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.chars_removed.fetch_add(chars_removed, Ordering::Relaxed);
        self.tokens_saved.fetch_add(tokens_saved, Ordering::Relaxed);

        ctx.custom
            .insert("minimizer_original".into(), json!(prompt));
        ctx.custom
            .insert("minimizer_chars_saved".into(), json!(chars_removed));
        ctx.custom
            .insert("minimizer_tokens_saved".into(), json!(tokens_saved));
        ctx.set_flag("minimized", true);

        debug!(
            request_id = %ctx.request_id,
            chars_removed,
            "Minimized prompt whitespace"
        );
        Ok(PreRequestOutcome::Continue(minimized))
    }
}

/// Minimizer statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimizerStats {
    pub requests_minimized: u64,
    pub chars_removed: u64,
    pub tokens_saved: u64,
    pub average_chars_per_request: f64,
}
