// =============================================================================
// Backfill Cache — per-symbol, per-date append-only resume files
// =============================================================================
//
// Layout: <data_dir>/cache/<YYYY-MM-DD>/backfill/<SYMBOL>.jsonl, one JSON
// record per line, timestamps already in the shifted frame. The cache is
// rebuildable state: a file that fails to decode is deleted and the symbol
// refetched from scratch. Each file has a single writer (the worker that
// owns the symbol); the day-switch scheduler is the sole deleter of date
// directories.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::types::TradeRecord;

pub struct BackfillCache {
    root: PathBuf,
}

impl BackfillCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("cache"),
        }
    }

    fn symbol_path(&self, date: NaiveDate, symbol: &str) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join("backfill")
            .join(format!("{symbol}.jsonl"))
    }

    /// Read every cached record for `(date, symbol)`. A missing file is an
    /// empty cache; a file with any undecodable line is deleted and reported
    /// as empty so the symbol is refetched from scratch.
    pub fn read(&self, date: NaiveDate, symbol: &str) -> Result<Vec<TradeRecord>> {
        let path = self.symbol_path(date, symbol);

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read cache file {}", path.display()))
            }
        };

        let mut records = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        symbol,
                        path = %path.display(),
                        error = %e,
                        "cache file failed to decode; deleting for refetch"
                    );
                    let _ = std::fs::remove_file(&path);
                    return Ok(Vec::new());
                }
            }
        }

        debug!(symbol, count = records.len(), "cache read");
        Ok(records)
    }

    /// Append records to the `(date, symbol)` cache file, creating the date
    /// directory as needed.
    pub fn append(&self, date: NaiveDate, symbol: &str, records: &[TradeRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.symbol_path(date, symbol);
        let dir = path.parent().expect("cache path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open cache file {}", path.display()))?;

        for record in records {
            let line = serde_json::to_string(record).context("failed to encode cache record")?;
            writeln!(file, "{line}")
                .with_context(|| format!("failed to append to {}", path.display()))?;
        }

        debug!(symbol, appended = records.len(), "cache appended");
        Ok(())
    }

    /// Delete the entire cache directory for one date (day switch).
    pub fn remove_date(&self, date: NaiveDate) -> Result<()> {
        let dir = self.root.join(date.format("%Y-%m-%d").to_string());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "cache date directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove cache dir {}", dir.display()))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, id: &str) -> TradeRecord {
        TradeRecord {
            symbol: "AAPL".into(),
            timestamp_et_ms: ts,
            price: 10.0,
            size_shares: 200,
            exchange: "N".into(),
            id: id.into(),
            conditions: "@".into(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackfillCache::new(dir.path());
        assert!(cache.read(date(), "AAPL").unwrap().is_empty());
    }

    #[test]
    fn append_then_read_round_trips_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackfillCache::new(dir.path());

        cache
            .append(date(), "AAPL", &[record(1000, "1"), record(5000, "2")])
            .unwrap();
        // A later session appends to the same file.
        cache.append(date(), "AAPL", &[record(7000, "3")]).unwrap();

        let records = cache.read(date(), "AAPL").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].id, "3");
        assert_eq!(
            records.iter().map(|r| r.timestamp_et_ms).max(),
            Some(7000)
        );
    }

    #[test]
    fn corrupt_file_is_deleted_and_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackfillCache::new(dir.path());
        cache.append(date(), "AAPL", &[record(1000, "1")]).unwrap();

        // Simulate a crash mid-append: a trailing partial line.
        let path = dir
            .path()
            .join("cache/2024-06-03/backfill/AAPL.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"symbol\":\"AAPL\",\"timest").unwrap();
        drop(file);

        assert!(cache.read(date(), "AAPL").unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn caches_are_scoped_per_symbol_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackfillCache::new(dir.path());
        let other_date = NaiveDate::from_ymd_opt(2024, 6, 4).unwrap();

        cache.append(date(), "AAPL", &[record(1000, "1")]).unwrap();
        cache.append(date(), "GME", &[record(2000, "2")]).unwrap();
        cache.append(other_date, "AAPL", &[record(3000, "3")]).unwrap();

        assert_eq!(cache.read(date(), "AAPL").unwrap().len(), 1);
        assert_eq!(cache.read(date(), "GME").unwrap().len(), 1);
        assert_eq!(cache.read(other_date, "AAPL").unwrap().len(), 1);
    }

    #[test]
    fn remove_date_drops_the_whole_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BackfillCache::new(dir.path());

        cache.append(date(), "AAPL", &[record(1000, "1")]).unwrap();
        cache.append(date(), "GME", &[record(2000, "2")]).unwrap();

        cache.remove_date(date()).unwrap();
        assert!(cache.read(date(), "AAPL").unwrap().is_empty());
        assert!(cache.read(date(), "GME").unwrap().is_empty());

        // Removing an absent date is fine.
        cache.remove_date(date()).unwrap();
    }
}
