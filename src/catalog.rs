use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One content item as published. `url` is the item's canonical identity
/// with the metrics source.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContentItem {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: String,
}

impl ContentItem {
    /// Whole days since the item last changed.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        let reference = self.modified_at.unwrap_or(self.published_at);
        now.signed_duration_since(reference).num_days().max(0)
    }
}

/// Read access to the item collection.
///
/// `page` returns a stable-ordered slice so batches can be fetched
/// independently without materializing every id.
pub trait Catalog: Send + Sync {
    fn count(&self) -> Result<usize, String>;

    fn page(&self, offset: usize, limit: usize) -> Result<Vec<ContentItem>, String>;

    fn get(&self, id: &str) -> Result<Option<ContentItem>, String>;
}

/// JSON-lines file, one `ContentItem` per line. Blank lines are skipped.
/// Every call streams the file; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct JsonlCatalog {
    path: PathBuf,
}

impl JsonlCatalog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lines(&self) -> Result<impl Iterator<Item = (usize, Result<String, String>)>, String> {
        let file = File::open(&self.path)
            .map_err(|e| format!("Failed to open catalog {}: {}", self.path.display(), e))?;
        let path = self.path.clone();
        Ok(BufReader::new(file)
            .lines()
            .enumerate()
            .map(move |(idx, line)| {
                (
                    idx + 1,
                    line.map_err(|e| format!("Failed to read {}: {}", path.display(), e)),
                )
            })
            .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty())))
    }

    fn parse(&self, line_no: usize, line: &str) -> Result<ContentItem, String> {
        serde_json::from_str(line).map_err(|e| {
            format!(
                "Invalid catalog entry at {}:{}: {}",
                self.path.display(),
                line_no,
                e
            )
        })
    }
}

impl Catalog for JsonlCatalog {
    fn count(&self) -> Result<usize, String> {
        let mut count = 0;
        for (_, line) in self.lines()? {
            line?;
            count += 1;
        }
        Ok(count)
    }

    fn page(&self, offset: usize, limit: usize) -> Result<Vec<ContentItem>, String> {
        self.lines()?
            .skip(offset)
            .take(limit)
            .map(|(line_no, line)| self.parse(line_no, &line?))
            .collect()
    }

    fn get(&self, id: &str) -> Result<Option<ContentItem>, String> {
        for (line_no, line) in self.lines()? {
            let item = self.parse(line_no, &line?)?;
            if item.id == id {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

/// In-memory catalog for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    items: Vec<ContentItem>,
    fail_pages: bool,
}

impl MemoryCatalog {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self {
            items,
            fail_pages: false,
        }
    }

    /// Make every `page` call fail, simulating an unreachable catalog.
    pub fn failing_pages(mut self) -> Self {
        self.fail_pages = true;
        self
    }
}

impl Catalog for MemoryCatalog {
    fn count(&self) -> Result<usize, String> {
        Ok(self.items.len())
    }

    fn page(&self, offset: usize, limit: usize) -> Result<Vec<ContentItem>, String> {
        if self.fail_pages {
            return Err("catalog page unavailable".to_string());
        }
        Ok(self.items.iter().skip(offset).take(limit).cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<ContentItem>, String> {
        Ok(self.items.iter().find(|item| item.id == id).cloned())
    }
}
