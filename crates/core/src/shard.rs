//! JSON-lines shards: the file contract between pipeline stages.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::PipelineError;

/// All `.jsonl` files directly under `dir`, sorted for stable run order.
pub fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingInput(format!(
            "shard directory not found: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_jsonl = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
        if is_jsonl {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    Ok(files)
}

pub struct ShardContents<T> {
    pub records: Vec<T>,
    /// Lines that did not parse; contained, logged, never fatal to the file.
    pub skipped_lines: usize,
}

/// Reads a shard line by line, skipping malformed records with a warning.
pub fn read_shard<T: DeserializeOwned>(path: &Path) -> Result<ShardContents<T>, PipelineError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut skipped_lines = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => records.push(record),
            Err(error) => {
                skipped_lines += 1;
                warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    %error,
                    "skipping malformed shard line"
                );
            }
        }
    }

    Ok(ShardContents {
        records,
        skipped_lines,
    })
}

/// Writes records as one JSON object per line, creating parent directories.
pub fn write_shard<T: Serialize>(path: &Path, records: &[T]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn round_trip_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let rows = vec![
            Row { id: 1, name: "phone".to_string() },
            Row { id: 2, name: "شاحن".to_string() },
        ];

        write_shard(&path, &rows).unwrap();
        let contents: ShardContents<Row> = read_shard(&path).unwrap();
        assert_eq!(contents.records, rows);
        assert_eq!(contents.skipped_lines, 0);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"id\":1,\"name\":\"ok\"}\nnot json\n\n{\"id\":2,\"name\":\"ok2\"}\n").unwrap();

        let contents: ShardContents<Row> = read_shard(&path).unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.skipped_lines, 1);
    }

    #[test]
    fn discovery_is_sorted_and_shallow() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.jsonl"), "").unwrap();
        fs::write(dir.path().join("a.jsonl"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.jsonl"), "").unwrap();

        let files = discover_shards(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.jsonl", "b.jsonl"]);
    }

    #[test]
    fn missing_directory_aborts() {
        let dir = tempdir().unwrap();
        let result = discover_shards(&dir.path().join("absent"));
        assert!(matches!(result, Err(PipelineError::MissingInput(_))));
    }
}
