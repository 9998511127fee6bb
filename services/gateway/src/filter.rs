//! Output cleaning for assembled chat answers
//!
//! The upstream answers with a research-style transcript: metadata echoes,
//! module logs, thinking traces, an HTML rendering of the report, and a long
//! detailed report after the short answer. `OutputFilter::clean` reduces that
//! to what the requested mode asks for. It is a pure function and applying
//! it twice gives the same result as applying it once.
//!
//! `StreamFilter` applies the same rules to a streamed answer a line at a
//! time: concise answers end at the first report marker, markup answers are
//! held back until the html fence closes.

use std::sync::LazyLock;

use regex::{Regex, RegexSet, RegexSetBuilder};
use serde_json::Value;
use upstream::OutputMode;

/// Where the concise answer ends and the detailed report begins.
const REPORT_MARKERS: &[&str] = &[
    "# 详细专业报告",
    "更详细的专业报告见下文",
    "--- 模块5.2:",
    "## 1. 执行摘要",
];

const THINKING_START: &str = "*Thinking...*";
const HTML_FENCE: &str = "```html";
const FENCE: &str = "```";

const METADATA_TYPES: &[&str] = &["conversation", "user-message", "assistant-message"];

/// Whole-line patterns that are always noise.
static NOISE_LINES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new([
        // Session metadata echoed as Python dict literals
        r"^\s*\{'type':\s*'(conversation|user-message|assistant-message)'.*?\}\s*$",
        r"^\s*深度研究:\s*(开启|关闭)\s*$",
        // Module logs
        r"^---\s*模块[\d\.]+.*?---\s*$",
        r"^输入(问题|关键词).*?[:：].*$",
        r"^(网络搜索|重试后).*?(返回|结束).*$",
        r"^\s*核心循环.*轮\s*$",
        r"^报告策略师.*$",
        r"^工作流总耗时.*秒\s*$",
        r"^.*计划最多获取\s*\d+\s*个结果.*$",
        // Thinking traces
        r"^\s*\*Thinking\.\.\.\*\s*$",
        r"^>\s*\*\*.*?\*\*\s*$",
        r"^>\s*$",
        r"^>\s*I'm\s+(currently|now|struggling|focusing).*$",
        r"^>\s*I've\s+(been|moved|decided).*$",
        r"^>\s*My\s+(focus|thought|role).*$",
        r"^>\s*The\s+(current|goal|lack|constraints).*$",
        r"^>\s*This\s+(approach|is|ensures).*$",
        // Section headings around the report
        r"^```html\s*$",
        r"^#\s*详细专业报告\s*$",
        r"^更详细的专业报告见下文。?\s*$",
        r"^=+\s*最终答案输出\s*=+\s*$",
    ])
    .case_insensitive(true)
    .build()
    .expect("noise patterns are valid")
});

/// Lines that are fragments of an HTML document.
static HTML_LINES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new([
        r"<!DOCTYPE\s+html>",
        r"<html\s+lang=",
        r"<head>",
        r"<style>",
        r"<body>",
        r"</html>",
    ])
    .case_insensitive(true)
    .build()
    .expect("html patterns are valid")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n)+").expect("blank-run pattern is valid"));

/// Mode-specific cleaner for one assembled answer.
#[derive(Debug, Clone, Copy)]
pub struct OutputFilter {
    mode: OutputMode,
}

impl OutputFilter {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn clean(&self, raw: &str) -> String {
        let text = match self.mode {
            OutputMode::Concise => strip_lines(truncate_at_report(raw)),
            OutputMode::Report => strip_lines(raw),
            OutputMode::Markup => extract_html(raw).to_string(),
        };
        collapse_blank_lines(&text)
    }
}

/// Everything before the first detailed-report marker.
fn truncate_at_report(text: &str) -> &str {
    REPORT_MARKERS
        .iter()
        .filter_map(|marker| text.find(marker))
        .min()
        .map_or(text, |idx| &text[..idx])
}

/// Body of the first ```html fence; the whole text when there is none.
fn extract_html(text: &str) -> &str {
    let Some(start) = text.find(HTML_FENCE) else {
        return text;
    };
    let body = &text[start + HTML_FENCE.len()..];
    match body.find(FENCE) {
        Some(end) => &body[..end],
        None => body,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Block {
    #[default]
    None,
    Thinking,
    Html,
}

/// Line classifier shared by the batch and streaming cleaners.
#[derive(Debug, Default)]
struct LineStripper {
    block: Block,
}

impl LineStripper {
    /// Whether `line` survives, given the lines seen before it.
    fn keep(&mut self, line: &str) -> bool {
        let trimmed = line.trim();

        if trimmed == THINKING_START {
            self.block = Block::Thinking;
            return false;
        }
        if trimmed == HTML_FENCE {
            self.block = Block::Html;
            return false;
        }
        if trimmed == FENCE && self.block == Block::Html {
            self.block = Block::None;
            return false;
        }

        match self.block {
            Block::Html => return false,
            Block::Thinking if trimmed.starts_with('>') => return false,
            // Thinking traces end at the first ordinary line
            Block::Thinking if !trimmed.is_empty() => self.block = Block::None,
            _ => {}
        }

        trimmed.is_empty() || !is_noise(trimmed)
    }
}

/// Drop noise lines, thinking traces and embedded HTML documents.
fn strip_lines(text: &str) -> String {
    let mut stripper = LineStripper::default();
    text.split('\n')
        .filter(|line| stripper.keep(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_noise(line: &str) -> bool {
    is_metadata_json(line) || HTML_LINES.is_match(line) || NOISE_LINES.is_match(line)
}

fn is_metadata_json(line: &str) -> bool {
    if !(line.starts_with('{') && line.ends_with('}')) {
        return false;
    }
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
        return false;
    };
    let typed = obj
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| METADATA_TYPES.contains(&t));
    typed || (obj.contains_key("conversation_id") && obj.contains_key("data"))
}

fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUNS.replace_all(text, "\n\n").trim().to_string()
}

/// Incremental cleaner for a streamed answer.
///
/// Upstream chunks split lines anywhere, so text is released only once its
/// line is complete. Blank runs collapse as they do in `OutputFilter::clean`.
#[derive(Debug)]
pub struct StreamFilter {
    mode: OutputMode,
    /// Incomplete last line; everything in markup mode
    pending: String,
    stripper: LineStripper,
    emitted: bool,
    blank_gap: bool,
    done: bool,
}

impl StreamFilter {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            pending: String::new(),
            stripper: LineStripper::default(),
            emitted: false,
            blank_gap: false,
            done: false,
        }
    }

    /// Whether the answer is complete and the rest of the upstream text
    /// would be discarded anyway.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one upstream chunk; returns the text ready to send, possibly empty.
    pub fn push(&mut self, chunk: &str) -> String {
        if self.done {
            return String::new();
        }
        self.pending.push_str(chunk);

        if self.mode == OutputMode::Markup {
            return self.release_markup(false);
        }

        let mut out = String::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.release_line(line.trim_end_matches(['\n', '\r']), &mut out);
            if self.done {
                self.pending.clear();
                break;
            }
        }
        out
    }

    /// End of the upstream answer: release whatever is still held back.
    pub fn finish(&mut self) -> String {
        if self.done {
            return String::new();
        }
        if self.mode == OutputMode::Markup {
            return self.release_markup(true);
        }

        let mut out = String::new();
        let last = std::mem::take(&mut self.pending);
        if !last.is_empty() {
            self.release_line(&last, &mut out);
        }
        self.done = true;
        out
    }

    /// The fenced block once it is closed; at the end, whatever there is.
    fn release_markup(&mut self, at_end: bool) -> String {
        let closed = self.pending.find(HTML_FENCE).is_some_and(|start| {
            self.pending[start + HTML_FENCE.len()..].contains(FENCE)
        });
        if !(closed || at_end) {
            return String::new();
        }
        self.done = true;
        let html = collapse_blank_lines(extract_html(&self.pending));
        self.pending.clear();
        html
    }

    fn release_line(&mut self, line: &str, out: &mut String) {
        let line = match self.mode {
            OutputMode::Concise => match REPORT_MARKERS.iter().filter_map(|m| line.find(m)).min() {
                Some(idx) => {
                    self.done = true;
                    &line[..idx]
                }
                None => line,
            },
            _ => line,
        };
        if !self.stripper.keep(line) {
            return;
        }

        if line.trim().is_empty() {
            self.blank_gap = self.emitted;
            return;
        }
        if self.emitted {
            out.push('\n');
            if self.blank_gap {
                out.push('\n');
            }
            out.push_str(line);
        } else {
            out.push_str(line.trim_start());
        }
        self.emitted = true;
        self.blank_gap = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concise(text: &str) -> String {
        OutputFilter::new(OutputMode::Concise).clean(text)
    }

    fn report(text: &str) -> String {
        OutputFilter::new(OutputMode::Report).clean(text)
    }

    fn markup(text: &str) -> String {
        OutputFilter::new(OutputMode::Markup).clean(text)
    }

    const TRANSCRIPT: &str = "深度研究: 开启\n\
        --- 模块1.0: 问题分析 ---\n\
        输入问题: 什么是Rust\n\
        *Thinking...*\n\
        > **Evaluating the question**\n\
        > I'm currently weighing options\n\
        \n\
        Rust is a systems language.\n\
        \n\
        \n\
        \n\
        It is memory safe.\n\
        {\"type\":\"conversation\",\"id\":1}\n\
        ```html\n\
        <!DOCTYPE html>\n\
        <p>rendered</p>\n\
        ```\n\
        # 详细专业报告\n\
        ## 1. 执行摘要\n\
        Long report body.\n\
        工作流总耗时 12.5 秒\n";

    #[test]
    fn concise_keeps_only_the_short_answer() {
        assert_eq!(
            concise(TRANSCRIPT),
            "Rust is a systems language.\n\nIt is memory safe."
        );
    }

    #[test]
    fn report_keeps_report_but_drops_noise_and_html() {
        let cleaned = report(TRANSCRIPT);
        assert!(cleaned.starts_with("Rust is a systems language."));
        assert!(cleaned.contains("## 1. 执行摘要"));
        assert!(cleaned.contains("Long report body."));
        assert!(!cleaned.contains("# 详细专业报告"), "heading line is noise");
        assert!(!cleaned.contains("<p>rendered</p>"));
        assert!(!cleaned.contains("工作流总耗时"));
        assert!(!cleaned.contains("Thinking"));
        assert!(!cleaned.contains("\n\n\n"));
    }

    #[test]
    fn markup_extracts_html_fence() {
        assert_eq!(markup(TRANSCRIPT), "<!DOCTYPE html>\n<p>rendered</p>");
    }

    #[test]
    fn markup_without_fence_is_trimmed_text() {
        assert_eq!(markup("  <p>bare</p>\n"), "<p>bare</p>");
    }

    #[test]
    fn unterminated_html_fence_runs_to_end() {
        assert_eq!(markup("intro\n```html\n<p>a</p>\n"), "<p>a</p>");
        assert_eq!(report("answer\n```html\n<p>a</p>\nmore"), "answer");
    }

    #[test]
    fn ordinary_code_fences_survive() {
        let text = "Example:\n```rust\nfn main() {}\n```\nDone.";
        assert_eq!(concise(text), text);
        assert_eq!(report(text), text);
    }

    #[test]
    fn thinking_block_ends_at_first_ordinary_line() {
        let text = "*Thinking...*\n> step one\n> step two\nAnswer.\n> quoted later";
        assert_eq!(concise(text), "Answer.\n> quoted later");
    }

    #[test]
    fn metadata_json_lines_are_dropped() {
        let text = "{\"conversation_id\":\"c1\",\"data\":{}}\nreal\n{\"type\":\"user-message\"}\n{\"k\":1}";
        assert_eq!(report(text), "real\n{\"k\":1}");
    }

    #[test]
    fn marker_mid_line_truncates_concise() {
        assert_eq!(concise("Short answer. 更详细的专业报告见下文。\nreport"), "Short answer.");
    }

    #[test]
    fn clean_is_idempotent() {
        let samples = [
            TRANSCRIPT,
            "plain",
            "",
            "\n\n  a  \n\n\n\nb\n",
            "*Thinking...*\n> x\n\n\nanswer\n```\ncode\n```",
            "```html\n<p>x</p>\n```\n```html\n<p>y</p>\n```",
            "> **Bold quote**\nkeep\n>\n> I've been thinking",
        ];
        for mode in [OutputMode::Concise, OutputMode::Report, OutputMode::Markup] {
            let filter = OutputFilter::new(mode);
            for sample in samples {
                let once = filter.clean(sample);
                assert_eq!(filter.clean(&once), once, "{mode:?} on {sample:?}");
            }
        }
    }

    fn streamed(mode: OutputMode, chunks: &[&str]) -> (String, bool) {
        let mut filter = StreamFilter::new(mode);
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&filter.push(chunk));
            if filter.is_done() {
                return (out, true);
            }
        }
        out.push_str(&filter.finish());
        (out, false)
    }

    /// Split text into awkward chunk sizes, the way the upstream does.
    fn ragged(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(7).map(|c| c.iter().collect()).collect()
    }

    #[test]
    fn streamed_concise_stops_at_report_marker() {
        let chunks = ragged(TRANSCRIPT);
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let (out, stopped_early) = streamed(OutputMode::Concise, &refs);
        assert_eq!(out, "Rust is a systems language.\n\nIt is memory safe.");
        assert!(stopped_early, "report body must not be read");
    }

    #[test]
    fn streamed_report_matches_batch_cleaning() {
        let chunks = ragged(TRANSCRIPT);
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let (out, stopped_early) = streamed(OutputMode::Report, &refs);
        assert_eq!(out, report(TRANSCRIPT));
        assert!(!stopped_early);
    }

    #[test]
    fn streamed_markup_waits_for_closing_fence() {
        let mut filter = StreamFilter::new(OutputMode::Markup);
        assert_eq!(filter.push("*Thinking...*\n> planning\n"), "");
        assert_eq!(filter.push("```html\n<p>rend"), "");
        assert_eq!(filter.push("ered</p>\n``"), "");
        assert_eq!(filter.push("`\n# 详细专业报告\n"), "<p>rendered</p>");
        assert!(filter.is_done());
        assert_eq!(filter.push("more"), "");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn streamed_markup_without_fence_flushes_at_end() {
        let (out, stopped_early) = streamed(OutputMode::Markup, &["  plain ", "answer\n"]);
        assert_eq!(out, "plain answer");
        assert!(!stopped_early);
    }

    #[test]
    fn streamed_marker_mid_line_keeps_prefix() {
        let (out, stopped_early) =
            streamed(OutputMode::Concise, &["Short answer. 更详细的", "专业报告见下文。\nreport"]);
        assert_eq!(out, "Short answer. ");
        assert!(stopped_early);
    }

    #[test]
    fn streamed_last_line_without_newline_is_flushed() {
        let (out, _) = streamed(OutputMode::Concise, &["first\n\n\n", "sec", "ond"]);
        assert_eq!(out, "first\n\nsecond");
    }
}
