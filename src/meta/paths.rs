use super::FileSchema;
use crate::status::Result;
use chrono::{Datelike, TimeZone, Utc};
use std::path::{Path, PathBuf};

pub fn table_path(root: &Path, table_id: &str) -> PathBuf {
    root.join("tables").join(table_id)
}

/// `tables/<table_id>/<yyyymmdd>/<segment_id>/`
pub fn segment_dir(root: &Path, file: &FileSchema) -> PathBuf {
    table_path(root, &file.table_id)
        .join(file.date.to_string())
        .join(&file.segment_id)
}

pub fn file_location(root: &Path, file: &FileSchema) -> PathBuf {
    segment_dir(root, file).join(format!("{}.vec", file.file_id))
}

/// The index blob sits next to its `.vec` payload.
pub fn index_location(vec_location: &Path) -> PathBuf {
    vec_location.with_extension("idx")
}

pub fn create_table_path(root: &Path, table_id: &str) -> Result<()> {
    std::fs::create_dir_all(table_path(root, table_id))?;
    Ok(())
}

pub fn create_segment_dir(root: &Path, file: &FileSchema) -> Result<()> {
    std::fs::create_dir_all(segment_dir(root, file))?;
    Ok(())
}

/// Remove a table directory tree. With `only_if_empty` the directory is kept
/// while any segment files remain under it.
pub fn remove_table_path(root: &Path, table_id: &str, only_if_empty: bool) {
    let dir = table_path(root, table_id);
    if !dir.exists() {
        return;
    }
    if only_if_empty && !dir_has_files(&dir) {
        let _ = std::fs::remove_dir_all(&dir);
    } else if !only_if_empty {
        let _ = std::fs::remove_dir_all(&dir);
    }
}

pub fn remove_file_payloads(file: &FileSchema) {
    let _ = std::fs::remove_file(&file.location);
    let _ = std::fs::remove_file(index_location(&file.location));
}

/// Remove the segment directory (and its now-empty date parent) once the
/// last file under it is gone.
pub fn remove_segment_dir(root: &Path, file: &FileSchema) {
    let dir = segment_dir(root, file);
    let _ = std::fs::remove_dir_all(&dir);
    if let Some(date_dir) = dir.parent() {
        let _ = std::fs::remove_dir(date_dir);
    }
}

fn dir_has_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            return true;
        }
        if path.is_dir() && dir_has_files(&path) {
            return true;
        }
    }
    false
}

pub fn today_date() -> i32 {
    let now = Utc::now();
    (now.year() * 10000 + now.month() as i32 * 100 + now.day() as i32) as i32
}

pub fn date_from_micros(micros: i64) -> i32 {
    match Utc.timestamp_micros(micros) {
        chrono::LocalResult::Single(dt) => {
            dt.year() * 10000 + dt.month() as i32 * 100 + dt.day() as i32
        }
        _ => today_date(),
    }
}
