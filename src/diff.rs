use serde::{Deserialize, Serialize};

/// Above this many line pairs the LCS table is skipped and the diff
/// degrades to "remove everything, add everything".
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "op", content = "text", rename_all = "snake_case")]
pub enum DiffLine {
    Unchanged(String),
    Added(String),
    Removed(String),
}

/// Line-level diff of a rewrite against its original.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffSummary {
    pub fn is_identical(&self) -> bool {
        self.added == 0 && self.removed == 0
    }

    /// Unified-style rendering: `+`, `-` or two spaces per line.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| match line {
                DiffLine::Unchanged(text) => format!("  {}", text),
                DiffLine::Added(text) => format!("+ {}", text),
                DiffLine::Removed(text) => format!("- {}", text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn diff_lines(original: &str, revised: &str) -> DiffSummary {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = revised.lines().collect();

    // Common prefix and suffix never need the table.
    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut lines = Vec::with_capacity(old.len().max(new.len()));
    lines.extend(old[..prefix].iter().map(|l| DiffLine::Unchanged(l.to_string())));
    lines.extend(diff_middle(old_mid, new_mid));
    lines.extend(old[old.len() - suffix..].iter().map(|l| DiffLine::Unchanged(l.to_string())));

    let mut summary = DiffSummary::default();
    for line in &lines {
        match line {
            DiffLine::Unchanged(_) => summary.unchanged += 1,
            DiffLine::Added(_) => summary.added += 1,
            DiffLine::Removed(_) => summary.removed += 1,
        }
    }
    summary.lines = lines;
    summary
}

fn diff_middle(old: &[&str], new: &[&str]) -> Vec<DiffLine> {
    if old.len().saturating_mul(new.len()) > MAX_LCS_CELLS {
        return old
            .iter()
            .map(|l| DiffLine::Removed(l.to_string()))
            .chain(new.iter().map(|l| DiffLine::Added(l.to_string())))
            .collect();
    }

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let width = new.len() + 1;
    let mut lcs = vec![0usize; (old.len() + 1) * width];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(old.len() + new.len());
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            out.push(DiffLine::Unchanged(old[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            out.push(DiffLine::Removed(old[i].to_string()));
            i += 1;
        } else {
            out.push(DiffLine::Added(new[j].to_string()));
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|l| DiffLine::Removed(l.to_string())));
    out.extend(new[j..].iter().map(|l| DiffLine::Added(l.to_string())));
    out
}
