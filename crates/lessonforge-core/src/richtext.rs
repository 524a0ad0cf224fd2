//! HTML to markdown-like plain text, used when rich text is placed into a
//! prompt. Only the tags the field editor produces are handled; anything
//! else is stripped.

use once_cell::sync::Lazy;
use regex::Regex;

static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</h[1-6]>|</ul>|</ol>").unwrap());
static HEADING_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<h([1-6])[^>]*>").unwrap());
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<li[^>]*>").unwrap());
static STRONG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?(strong|b)(\s[^>]*)?>").unwrap());
static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?(em|i)(\s[^>]*)?>").unwrap());
static CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?code(\s[^>]*)?>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Normalize editor HTML into the plain form fed to the model.
pub fn html_to_markdown(html: &str) -> String {
    let text = HEADING_OPEN.replace_all(html, |caps: &regex::Captures<'_>| {
        let level: usize = caps[1].parse().unwrap_or(1);
        format!("\n{} ", "#".repeat(level))
    });
    let text = LIST_ITEM.replace_all(&text, "\n- ");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = STRONG.replace_all(&text, "**");
    let text = EMPHASIS.replace_all(&text, "*");
    let text = CODE.replace_all(&text, "`");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_entities(&text);

    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let joined = lines.join("\n");
    BLANK_RUNS
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        // last, so "&amp;lt;" stays "&lt;"
        .replace("&amp;", "&")
}

/// Wrap model text for the rich text editor: one `<p>` per blank-line
/// separated paragraph. Text that already looks like HTML is kept.
pub fn text_to_html(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('<') {
        return trimmed.to_string();
    }
    trimmed
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let escaped = p
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('\n', "<br>");
            format!("<p>{escaped}</p>")
        })
        .collect()
}
