use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Write a worklog entry for a finished job or single-item operation.
///
/// Appends an entry to `<worklog_dir>/YYYY-MM.md`.
/// Creates the file and parent directories if missing.
///
/// Format:
/// ```text
/// ## {datetime} - {subject}
///
/// - **Action:** {action}
/// - **Outcome:** {outcome}
/// - **Summary:** {summary}
///
/// ---
/// ```
pub fn write_entry(
    worklog_dir: &Path,
    subject: &str,
    action: &str,
    outcome: &str,
    summary: &str,
) -> Result<(), String> {
    let now = chrono::Utc::now();
    let filename = now.format("%Y-%m").to_string();
    let worklog_path = worklog_dir.join(format!("{}.md", filename));

    fs::create_dir_all(worklog_dir).map_err(|e| {
        format!(
            "Failed to create worklog directory {}: {}",
            worklog_dir.display(),
            e
        )
    })?;

    let entry = format!(
        "## {} - {}\n\n- **Action:** {}\n- **Outcome:** {}\n- **Summary:** {}\n\n---\n\n",
        now.to_rfc3339(),
        subject,
        action,
        outcome,
        summary,
    );

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&worklog_path)
        .map_err(|e| format!("Failed to open worklog at {}: {}", worklog_path.display(), e))?;

    file.write_all(entry.as_bytes())
        .map_err(|e| format!("Failed to write worklog at {}: {}", worklog_path.display(), e))?;

    Ok(())
}
