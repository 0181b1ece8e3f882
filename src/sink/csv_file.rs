use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tempfile::NamedTempFile;

use crate::error::SinkError;
use crate::model::{BarRecord, Series, COLUMNS};

use super::{check_columns, merge_by_timestamp, Sink, TargetInfo, WriteReport};

/// One CSV file per series under `dir`, named `{symbol}_{days}days_{interval}.csv`.
///
/// Writes are read-merge-write: the complete new file is prepared in a temp
/// file next to the target and renamed over it, so a failed write leaves the
/// previous file untouched.
pub struct CsvSink {
    dir: PathBuf,
    days: u32,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>, days: u32) -> Self {
        Self {
            dir: dir.into(),
            days,
        }
    }

    pub fn path_for(&self, series: &Series) -> PathBuf {
        self.dir.join(series.csv_file_name(self.days))
    }

    fn load(path: &Path, target: &str) -> Result<BTreeMap<NaiveDateTime, BarRecord>, SinkError> {
        let mut reader =
            csv::Reader::from_path(path).map_err(|e| SinkError::persistence(target, e))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SinkError::persistence(target, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        check_columns(target, &headers)?;

        let mut rows = BTreeMap::new();
        for rec in reader.deserialize::<BarRecord>() {
            let rec = rec.map_err(|e| SinkError::persistence(target, e))?;
            rows.insert(rec.date, rec);
        }
        Ok(rows)
    }

    fn write_all(
        &self,
        path: &Path,
        target: &str,
        rows: &BTreeMap<NaiveDateTime, BarRecord>,
    ) -> Result<(), SinkError> {
        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| SinkError::persistence(target, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(tmp);
        writer
            .write_record(COLUMNS)
            .map_err(|e| SinkError::persistence(target, e))?;
        for rec in rows.values() {
            writer
                .serialize(rec)
                .map_err(|e| SinkError::persistence(target, e))?;
        }
        let mut tmp = writer
            .into_inner()
            .map_err(|e| SinkError::persistence(target, e.into_error()))?;
        tmp.flush().map_err(|e| SinkError::persistence(target, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SinkError::persistence(target, e))?;
        tmp.persist(path)
            .map_err(|e| SinkError::persistence(target, e.error))?;
        Ok(())
    }
}

impl Sink for CsvSink {
    fn target(&self, series: &Series) -> String {
        self.path_for(series).display().to_string()
    }

    fn write_batch(
        &mut self,
        series: &Series,
        records: &[BarRecord],
    ) -> Result<WriteReport, SinkError> {
        let path = self.path_for(series);
        let target = path.display().to_string();
        std::fs::create_dir_all(&self.dir).map_err(|e| SinkError::persistence(&target, e))?;

        let existing = if path.exists() {
            Self::load(&path, &target)?
        } else {
            BTreeMap::new()
        };
        let merged = merge_by_timestamp(existing, records);
        self.write_all(&path, &target, &merged.rows)?;

        tracing::info!(
            series = %series,
            path = %target,
            inserted = merged.inserted,
            updated = merged.updated,
            total = merged.rows.len(),
            "CSV written"
        );
        Ok(WriteReport {
            target,
            inserted: merged.inserted,
            updated: merged.updated,
            total_rows: merged.rows.len(),
        })
    }

    fn describe(&mut self, series: &Series) -> Result<Option<TargetInfo>, SinkError> {
        let path = self.path_for(series);
        if !path.exists() {
            return Ok(None);
        }
        let target = path.display().to_string();
        let rows = Self::load(&path, &target)?;
        Ok(Some(TargetInfo {
            row_count: rows.len(),
            first: rows.keys().next().copied(),
            last: rows.keys().next_back().copied(),
            target,
        }))
    }
}
