mod common;

use std::fs;

use refresh_golem::catalog::{Catalog, JsonlCatalog, MemoryCatalog};

use common::{fixed_time, make_items};

fn write_catalog(dir: &std::path::Path, count: usize) -> std::path::PathBuf {
    let path = dir.join("catalog.jsonl");
    let mut contents = String::new();
    for (idx, item) in make_items(count).iter().enumerate() {
        contents.push_str(&serde_json::to_string(item).unwrap());
        contents.push('\n');
        if idx == 1 {
            contents.push('\n');
        }
    }
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn jsonl_catalog_counts_and_pages_skipping_blank_lines() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = JsonlCatalog::new(&write_catalog(dir.path(), 5));

    assert_eq!(catalog.count().unwrap(), 5);
    let page: Vec<String> = catalog.page(2, 2).unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(page, vec!["p-0002", "p-0003"]);
    assert!(catalog.page(10, 5).unwrap().is_empty());
}

#[test]
fn jsonl_catalog_get_finds_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = JsonlCatalog::new(&write_catalog(dir.path(), 3));
    assert_eq!(catalog.get("p-0001").unwrap().unwrap().url, "https://example.com/p-0001");
    assert!(catalog.get("missing").unwrap().is_none());
}

#[test]
fn jsonl_catalog_reports_bad_lines_with_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.jsonl");
    fs::write(&path, "{\"id\": \"a\"}\n").unwrap();
    let err = JsonlCatalog::new(&path).page(0, 1).unwrap_err();
    assert!(err.contains("catalog.jsonl:1"), "{}", err);
}

#[test]
fn missing_catalog_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = JsonlCatalog::new(&dir.path().join("nope.jsonl"));
    assert!(catalog.count().unwrap_err().contains("Failed to open catalog"));
}

#[test]
fn memory_catalog_pages_in_order() {
    let catalog = MemoryCatalog::new(make_items(4));
    assert_eq!(catalog.count().unwrap(), 4);
    assert_eq!(catalog.page(3, 10).unwrap().len(), 1);
    assert!(MemoryCatalog::new(make_items(1)).failing_pages().page(0, 1).is_err());
}

#[test]
fn age_counts_from_last_modification() {
    let mut item = make_items(1).remove(0);
    item.published_at = fixed_time(2024, 1, 1);
    item.modified_at = Some(fixed_time(2026, 1, 1));
    assert_eq!(item.age_days(fixed_time(2026, 1, 31)), 30);

    item.modified_at = None;
    assert_eq!(item.age_days(fixed_time(2024, 1, 11)), 10);
    assert_eq!(item.age_days(fixed_time(2023, 12, 1)), 0, "future dates clamp to zero");
}
