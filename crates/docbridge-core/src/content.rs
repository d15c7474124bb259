//! Issue title and body assembly.
//!
//! The `AB#<id>` marker appears in both the title and the body. The body
//! copy is what duplicate detection searches for, so it must survive any
//! manual edits to the title.

use crate::types::{ResolvedTarget, WorkItem};

/// `[AB#1234] <work item title>`
pub fn issue_title(item: &WorkItem) -> String {
    format!("[AB#{}] {}", item.id, item.title)
}

/// Markdown body carrying everything an assignee needs to act without
/// opening the tracker: the source link, the requested change, and the
/// target document.
pub fn issue_body(item: &WorkItem, target: &ResolvedTarget) -> String {
    let mut body = String::new();

    body.push_str("## Work Item Details\n\n");
    match &item.source_url {
        Some(url) => body.push_str(&format!("**ID:** [AB#{}]({})\n", item.id, url)),
        None => body.push_str(&format!("**ID:** AB#{}\n", item.id)),
    }
    body.push_str(&format!(
        "**Nature of Request:** {}\n",
        non_empty_or(&item.nature_of_request, "(not provided)")
    ));
    if let Some(url) = &item.doc_url {
        body.push_str(&format!("**Document:** {}\n", url));
    }
    if let Some(author) = &target.author {
        body.push_str(&format!("**Document Author:** {}\n", author));
    }

    body.push_str("\n## Change Details\n\n");
    body.push_str("**Text to change:**\n\n");
    push_fenced(&mut body, &item.text_to_change);
    body.push_str("**Proposed new text:**\n\n");
    push_fenced(&mut body, &item.proposed_new_text);

    body.push_str("## Repository Information\n\n");
    body.push_str(&format!("**Repository:** {}\n", target.slug()));
    body.push_str(&format!("**Source file:** {}\n", target.source_doc_url));

    body.push_str("\n---\n");
    body.push_str(&format!(
        "_Opened automatically from work item AB#{}. Do not remove this line._\n",
        item.id
    ));

    body
}

/// The search string duplicate detection matches against issue bodies.
pub fn marker(work_item_id: u64) -> String {
    format!("AB#{work_item_id}")
}

fn non_empty_or<'a>(s: &'a str, fallback: &'a str) -> &'a str {
    if s.trim().is_empty() {
        fallback
    } else {
        s
    }
}

fn push_fenced(body: &mut String, text: &str) {
    body.push_str("```\n");
    if text.trim().is_empty() {
        body.push_str("(not provided)\n");
    } else {
        body.push_str(text.trim_end());
        body.push('\n');
    }
    body.push_str("```\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        let mut item = WorkItem::new(4512, "Fix retry docs", "raw");
        item.nature_of_request = "Modify existing docs".to_string();
        item.doc_url = Some("https://learn.example.com/docs/retries".to_string());
        item.text_to_change = "Retries are unlimited.".to_string();
        item.proposed_new_text = "Retries stop after four attempts.".to_string();
        item.source_url =
            Some("https://dev.azure.com/org/project/_workitems/edit/4512".to_string());
        item
    }

    fn target() -> ResolvedTarget {
        ResolvedTarget {
            owner: "octo".to_string(),
            repo: "docs".to_string(),
            source_doc_url: "https://github.com/octo/docs/blob/main/retries.md".to_string(),
            author: Some("mruiz".to_string()),
        }
    }

    #[test]
    fn title_carries_marker_and_original_title() {
        assert_eq!(issue_title(&item()), "[AB#4512] Fix retry docs");
    }

    #[test]
    fn body_contains_marker_and_sections() {
        let body = issue_body(&item(), &target());
        assert!(body.contains("AB#4512"));
        assert!(body.contains("## Work Item Details"));
        assert!(body.contains("## Change Details"));
        assert!(body.contains("## Repository Information"));
        assert!(body.contains("octo/docs"));
        assert!(body.contains("Retries are unlimited."));
        assert!(body.contains("Retries stop after four attempts."));
        assert!(body.contains("**Document Author:** mruiz"));
    }

    #[test]
    fn body_links_source_url_when_present() {
        let body = issue_body(&item(), &target());
        assert!(body.contains("[AB#4512](https://dev.azure.com/org/project/_workitems/edit/4512)"));
    }

    #[test]
    fn empty_change_text_renders_placeholder() {
        let mut it = item();
        it.text_to_change = String::new();
        it.proposed_new_text = "   ".to_string();
        let body = issue_body(&it, &target());
        assert_eq!(body.matches("(not provided)").count(), 2);
    }

    #[test]
    fn marker_format() {
        assert_eq!(marker(77), "AB#77");
    }
}
