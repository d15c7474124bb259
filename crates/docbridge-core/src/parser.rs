//! Field parser: freeform work-item descriptions → structured fields.
//!
//! Parsing never raises for malformed input. A description that lacks a
//! recognizable "Nature of Request" or doc-link section is reported as a
//! tagged [`ParseReason`] and the item ends up `Skipped`, an expected and
//! common outcome rather than an exceptional one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// ParsedFields / ParseReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFields {
    pub nature_of_request: String,
    pub doc_url: String,
    /// May be empty: some requests only describe the new text.
    pub text_to_change: String,
    pub proposed_new_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ParseReason {
    MissingNature,
    MissingDocLink,
    /// The item parsed, but its nature of request is not a
    /// modify-existing-docs change and this pipeline does not handle it.
    UnsupportedNature { nature: String },
}

impl fmt::Display for ParseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseReason::MissingNature => {
                write!(f, "no recognizable 'Nature of Request' section")
            }
            ParseReason::MissingDocLink => write!(f, "no recognizable 'Link to Doc' section"),
            ParseReason::UnsupportedNature { nature } => {
                write!(f, "nature of request is not a modify-existing-docs change: {nature}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Section headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Nature,
    DocLink,
    TextToChange,
    ProposedText,
    /// "If adding brand new docs:" is a boundary in the request template
    /// that terminates the preceding section but is never captured itself.
    Boundary,
}

/// One regex per recognized header, case-insensitive and tolerant of minor
/// label variants ("Link to doc" vs "Link to Docs").
fn header_patterns() -> &'static [(Section, Regex)] {
    static PATTERNS: OnceLock<Vec<(Section, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Section::Nature,
                Regex::new(r"(?i)nature\s+of\s+request\s*:").unwrap(),
            ),
            (
                Section::DocLink,
                Regex::new(r"(?i)link\s+to\s+docs?\s*:").unwrap(),
            ),
            (
                Section::TextToChange,
                Regex::new(r"(?i)text\s+to\s+change\s*:").unwrap(),
            ),
            (
                Section::ProposedText,
                Regex::new(r"(?i)proposed\s+new\s+text\s*:").unwrap(),
            ),
            (
                Section::Boundary,
                Regex::new(r"(?i)if\s+adding\s+brand\s+new\s+docs\s*:").unwrap(),
            ),
        ]
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a raw description into structured fields.
///
/// HTML is stripped and entities decoded first (tracker descriptions are
/// rich text). Section bodies run from the end of their header to the start
/// of the next recognized header and are preserved verbatim, trimmed of
/// leading/trailing whitespace only.
pub fn parse_description(raw: &str) -> Result<ParsedFields, ParseReason> {
    let clean = decode_entities(&strip_html(raw));

    // Locate every header occurrence, in document order.
    let mut markers: Vec<(usize, usize, Section)> = Vec::new();
    for (section, re) in header_patterns() {
        for m in re.find_iter(&clean) {
            markers.push((m.start(), m.end(), *section));
        }
    }
    markers.sort_by_key(|(start, _, _)| *start);

    let body_of = |wanted: Section| -> Option<String> {
        let (idx, (_, end, _)) = markers
            .iter()
            .enumerate()
            .find(|(_, (_, _, s))| *s == wanted)?;
        let until = markers
            .get(idx + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(clean.len());
        Some(clean[*end..until].trim().to_string())
    };

    let nature = body_of(Section::Nature)
        .map(first_line)
        .filter(|s| !s.is_empty())
        .ok_or(ParseReason::MissingNature)?;

    let doc_url = body_of(Section::DocLink)
        .and_then(|body| {
            body.split_whitespace()
                .next()
                .map(|t| t.trim_end_matches('-').to_string())
        })
        .filter(|s| !s.is_empty())
        .ok_or(ParseReason::MissingDocLink)?;

    let nature_lower = nature.to_lowercase();
    if !nature_lower.contains("modify existing docs")
        && !nature_lower.contains("modifying existing docs")
    {
        return Err(ParseReason::UnsupportedNature { nature });
    }

    Ok(ParsedFields {
        nature_of_request: nature,
        doc_url,
        text_to_change: body_of(Section::TextToChange).unwrap_or_default(),
        proposed_new_text: body_of(Section::ProposedText).unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// HTML cleanup
// ---------------------------------------------------------------------------

/// Remove HTML tags. Block-level closers and `<br>` become newlines so that
/// adjacent rich-text sections don't glue together.
pub fn strip_html(input: &str) -> String {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    let block = BLOCK.get_or_init(|| {
        Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</li>|</tr>|</h[1-6]>").unwrap()
    });
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());

    let with_newlines = block.replace_all(input, "\n");
    tag.replace_all(&with_newlines, "").into_owned()
}

/// Decode the HTML entities that show up in tracker rich text. Named basics
/// plus decimal/hex numeric references.
pub fn decode_entities(input: &str) -> String {
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    let entity = ENTITY.get_or_init(|| Regex::new(r"&(#x?[0-9a-fA-F]+|[a-zA-Z]+);").unwrap());

    entity
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match name {
                "amp" => "&".to_string(),
                "lt" => "<".to_string(),
                "gt" => ">".to_string(),
                "quot" => "\"".to_string(),
                "apos" => "'".to_string(),
                "nbsp" => " ".to_string(),
                _ if name.starts_with("#x") || name.starts_with("#X") => {
                    u32::from_str_radix(&name[2..], 16)
                        .ok()
                        .and_then(char::from_u32)
                        .map(String::from)
                        .unwrap_or_else(|| caps[0].to_string())
                }
                _ if name.starts_with('#') => name[1..]
                    .parse::<u32>()
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_else(|| caps[0].to_string()),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn first_line(body: String) -> String {
    body.lines().next().unwrap_or_default().trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "Nature of Request: Modify existing docs\n\
        Link to Doc: https://learn.example/doc1\n\
        Text to Change:\n\
        Proposed new text: Remove last two links from Related content";

    #[test]
    fn parses_template_with_empty_text_to_change() {
        let fields = parse_description(TEMPLATE).unwrap();
        assert_eq!(fields.nature_of_request, "Modify existing docs");
        assert_eq!(fields.doc_url, "https://learn.example/doc1");
        assert_eq!(fields.text_to_change, "");
        assert_eq!(
            fields.proposed_new_text,
            "Remove last two links from Related content"
        );
    }

    #[test]
    fn missing_nature_is_parse_failure() {
        let raw = "Link to Doc: https://learn.example/doc1\nProposed new text: x";
        assert_eq!(parse_description(raw), Err(ParseReason::MissingNature));
    }

    #[test]
    fn missing_doc_link_is_parse_failure() {
        let raw = "Nature of Request: Modify existing docs\nProposed new text: x";
        assert_eq!(parse_description(raw), Err(ParseReason::MissingDocLink));
    }

    #[test]
    fn unsupported_nature_is_reported_with_value() {
        let raw = "Nature of Request: Report a broken link\n\
            Link to Doc: https://learn.example/doc1";
        match parse_description(raw) {
            Err(ParseReason::UnsupportedNature { nature }) => {
                assert_eq!(nature, "Report a broken link");
            }
            other => panic!("expected UnsupportedNature, got {other:?}"),
        }
    }

    #[test]
    fn label_variants_are_tolerated() {
        let raw = "nature of request: Modifying existing docs\n\
            Link to doc: https://learn.example/doc2\n\
            proposed NEW text: hello";
        let fields = parse_description(raw).unwrap();
        assert_eq!(fields.doc_url, "https://learn.example/doc2");
        assert_eq!(fields.proposed_new_text, "hello");
    }

    #[test]
    fn html_is_stripped_and_entities_decoded() {
        let raw = "<div>Nature of Request: Modify existing docs</div>\
            <div>Link to Doc: https://learn.example/doc3</div>\
            <div>Text to Change: use &quot;foo&amp;bar&quot;</div>\
            <div>Proposed new text: use &lt;baz&gt;</div>";
        let fields = parse_description(raw).unwrap();
        assert_eq!(fields.nature_of_request, "Modify existing docs");
        assert_eq!(fields.text_to_change, "use \"foo&bar\"");
        assert_eq!(fields.proposed_new_text, "use <baz>");
    }

    #[test]
    fn multiline_bodies_are_preserved_verbatim() {
        let raw = "Nature of Request: Modify existing docs\n\
            Link to Doc: https://learn.example/doc4\n\
            Text to Change:\nline one\n  line two\n\n\
            Proposed new text:\nnew one\nnew two\n";
        let fields = parse_description(raw).unwrap();
        assert_eq!(fields.text_to_change, "line one\n  line two");
        assert_eq!(fields.proposed_new_text, "new one\nnew two");
    }

    #[test]
    fn brand_new_docs_boundary_terminates_proposed_text() {
        let raw = "Nature of Request: Modify existing docs\n\
            Link to Doc: https://learn.example/doc5\n\
            Proposed new text: the replacement\n\
            If adding brand new docs: n/a";
        let fields = parse_description(raw).unwrap();
        assert_eq!(fields.proposed_new_text, "the replacement");
    }

    #[test]
    fn doc_link_trailing_dashes_are_trimmed() {
        let raw = "Nature of Request: Modify existing docs\n\
            Link to Doc: https://learn.example/doc6---\n";
        let fields = parse_description(raw).unwrap();
        assert_eq!(fields.doc_url, "https://learn.example/doc6");
    }

    #[test]
    fn numeric_entities_decode() {
        assert_eq!(decode_entities("a&#39;b&#x41;c"), "a'bAc");
        assert_eq!(decode_entities("&bogus;"), "&bogus;");
    }
}
