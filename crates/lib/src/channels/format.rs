//! Reply post-processing for WhatsApp's text formatting and length limit.

use regex::Regex;
use std::sync::OnceLock;

/// Appended when a reply is cut to the channel limit.
pub const TRUNCATION_MARKER: &str = "…";

struct Patterns {
    citation: Regex,
    numeric_ref: Regex,
    bold: Regex,
    underline: Regex,
    heading: Regex,
    trailing_space: Regex,
    blank_runs: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // File-search annotations, e.g. 【4:0†source】.
        citation: Regex::new(r"【[^】]*】").expect("valid regex"),
        numeric_ref: Regex::new(r"\[\d+(?:,\s*\d+)*\]").expect("valid regex"),
        bold: Regex::new(r"\*\*([^*\n]+?)\*\*").expect("valid regex"),
        underline: Regex::new(r"__([^_\n]+?)__").expect("valid regex"),
        heading: Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)(?:[ \t]+#+)?[ \t]*$")
            .expect("valid regex"),
        trailing_space: Regex::new(r"(?m)[ \t]+$").expect("valid regex"),
        blank_runs: Regex::new(r"\n{3,}").expect("valid regex"),
    })
}

/// Clean an assistant reply for the channel and cap it at `max_chars` characters.
///
/// Removes citation markers, maps markdown emphasis to WhatsApp's (`*bold*`, `_italic_`),
/// turns headings into bold lines, collapses runs of blank lines, and truncates with
/// [`TRUNCATION_MARKER`] instead of failing on long output.
pub fn format_reply(text: &str, max_chars: usize) -> String {
    let p = patterns();
    let s = p.citation.replace_all(text, "");
    let s = p.numeric_ref.replace_all(&s, "");
    let s = p.heading.replace_all(&s, "*$1*");
    let s = p.bold.replace_all(&s, "*$1*");
    let s = p.underline.replace_all(&s, "_${1}_");
    let s = p.trailing_space.replace_all(&s, "");
    let s = p.blank_runs.replace_all(&s, "\n\n");
    truncate_chars(s.trim(), max_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_chars.saturating_sub(marker_len);
    let mut out: String = s.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push_str(TRUNCATION_MARKER);
    out
}
