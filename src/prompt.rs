use crate::catalog::ContentItem;
use crate::types::{Finding, TrackedItem};

/// Body text beyond this many characters is truncated in prompts.
const MAX_BODY_CHARS: usize = 60_000;

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Shared header: the item's identity and its latest search metrics.
fn build_item_context(item: &ContentItem, tracked: Option<&TrackedItem>) -> String {
    let mut lines = vec![
        "## Content Item".to_string(),
        String::new(),
        format!("- **ID:** {}", item.id),
        format!("- **URL:** {}", item.url),
        format!("- **Title:** {}", item.title),
        format!("- **Published:** {}", item.published_at.format("%Y-%m-%d")),
    ];
    if let Some(modified) = item.modified_at {
        lines.push(format!("- **Last modified:** {}", modified.format("%Y-%m-%d")));
    }

    if let Some(tracked) = tracked {
        let current = &tracked.current;
        let previous = &tracked.previous;
        lines.push(String::new());
        lines.push("## Search Performance".to_string());
        lines.push(String::new());
        lines.push(format!(
            "- Current window: {} clicks, {} impressions, CTR {:.2}%, avg position {:.1}",
            current.clicks,
            current.impressions,
            current.ctr * 100.0,
            current.position
        ));
        lines.push(format!(
            "- Previous window: {} clicks, {} impressions, CTR {:.2}%, avg position {:.1}",
            previous.clicks,
            previous.impressions,
            previous.ctr * 100.0,
            previous.position
        ));
        lines.push(format!("- Priority score: {}/90", tracked.priority_score));
    }

    lines.join("\n")
}

fn build_body_section(item: &ContentItem) -> String {
    format!(
        "## Current Content\n\n<content>\n{}\n</content>",
        truncate_body(&item.body)
    )
}

/// Prompt asking for a structured list of refresh findings.
pub fn build_analysis_prompt(item: &ContentItem, tracked: Option<&TrackedItem>) -> String {
    let instructions = "## Task\n\n\
        Review the content above for freshness problems: outdated facts, stale dates, \
        broken or missing sections, and search-intent gaps suggested by the metrics.\n\n\
        ## Output\n\n\
        Respond with a single JSON object and nothing else:\n\n\
        ```json\n\
        {\"findings\": [{\"category\": \"...\", \"severity\": \"low|medium|high\", \
        \"summary\": \"...\", \"recommendation\": \"...\"}]}\n\
        ```\n\n\
        Return an empty `findings` array if nothing needs to change.";

    [
        build_item_context(item, tracked),
        build_body_section(item),
        instructions.to_string(),
    ]
    .join("\n\n")
}

/// Prompt asking for a full rewrite, guided by the latest findings.
pub fn build_draft_prompt(
    item: &ContentItem,
    tracked: Option<&TrackedItem>,
    findings: &[Finding],
) -> String {
    let mut sections = vec![build_item_context(item, tracked)];

    if !findings.is_empty() {
        let list: Vec<String> = findings
            .iter()
            .map(|f| {
                if f.recommendation.is_empty() {
                    format!("- [{}] {}", f.severity, f.summary)
                } else {
                    format!("- [{}] {} (fix: {})", f.severity, f.summary, f.recommendation)
                }
            })
            .collect();
        sections.push(format!("## Findings To Address\n\n{}", list.join("\n")));
    }

    sections.push(build_body_section(item));
    sections.push(
        "## Task\n\n\
        Rewrite the content so it is accurate and current. Keep the structure, \
        voice and length broadly the same. Output only the rewritten content, \
        with no commentary before or after it."
            .to_string(),
    );

    sections.join("\n\n")
}
