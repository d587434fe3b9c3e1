//! Markdown stripping so only speakable text reaches the synthesizer.

use std::sync::LazyLock;

use regex::Regex;

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

fn rule(pattern: &str, replacement: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("invalid speech-cleaning pattern"),
        replacement,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Fenced code, including an unterminated trailing fence
        rule(r"(?s)```.*?```", " "),
        rule(r"(?s)```.*$", " "),
        rule(r"!\[[^\]]*\]\([^)]*\)", ""),
        rule(r"\[([^\]]+)\]\([^)]*\)", "$1"),
        rule(r"`([^`]+)`", "$1"),
        rule(r"https?://\S+", ""),
        rule(r"<[^>\n]+>", ""),
        rule(r"(?m)^[ \t]*([-*_][ \t]*){3,}$", ""),
        rule(r"(?m)^[ \t]{0,3}#{1,6}[ \t]*", ""),
        rule(r"(?m)^[ \t]*>[ \t]?", ""),
        rule(r"(?m)^[ \t]*(?:[-*+]|\d+[.)])[ \t]+", ""),
        rule(r"\*+|~~", ""),
        rule(r"\b_([^_\n]+)_\b", "$1"),
        rule(r"\|", " "),
        rule(r"[ \t]+", " "),
        rule(r"(?m)^ | $", ""),
        rule(r"\n{3,}", "\n\n"),
    ]
});

/// Strip markdown constructs and collapse whitespace.
///
/// Code blocks are dropped entirely; links keep their label. Paragraph
/// breaks survive as newlines so the chunker can use them as boundaries.
pub fn clean_for_speech(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n");
    for rule in RULES.iter() {
        out = rule
            .pattern
            .replace_all(&out, rule.replacement)
            .into_owned();
    }
    out.trim().to_string()
}
