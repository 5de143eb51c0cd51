use crate::history::TimeSeriesTable;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create run directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write chunk {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn create(base: &Path, started: &DateTime<Local>) -> Result<Self, PersistError> {
        Self::create_in(base, &started.format("nodetop_%Y%m%d_%H%M%S").to_string())
    }

    pub fn create_in(base: &Path, name: &str) -> Result<Self, PersistError> {
        let dir = base.join(name);
        fs::create_dir_all(&dir).map_err(|source| PersistError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        info!(dir = %dir.display(), "persisting history chunks");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, kind: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{kind}_{index:03}.csv"))
    }

    pub fn write_chunk(
        &self,
        kind: &str,
        index: usize,
        table: &TimeSeriesTable,
    ) -> Result<PathBuf, PersistError> {
        let path = self.chunk_path(kind, index);
        let tmp = path.with_extension("csv.tmp");
        let write_err = |source| PersistError::Write {
            path: path.clone(),
            source,
        };
        fs::write(&tmp, to_csv(table)).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(path)
    }
}

pub fn to_csv(table: &TimeSeriesTable) -> String {
    let mut out = String::from("time");
    for column in table.columns() {
        out.push(',');
        out.push_str(&quote(column));
    }
    out.push('\n');

    for (row, time) in table.times().enumerate() {
        let _ = write!(out, "{time}");
        for cell in table.row(row) {
            out.push(',');
            if let Some(value) = cell {
                let _ = write!(out, "{value:.1}");
            }
        }
        out.push('\n');
    }
    out
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_directory_is_named_by_start_time() {
        let base = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let store = ChunkStore::create(base.path(), &started).unwrap();
        assert_eq!(store.dir(), base.path().join("nodetop_20240309_070501"));
        assert!(store.dir().is_dir());
        assert_eq!(
            store.chunk_path("cpu", 7),
            base.path().join("nodetop_20240309_070501/cpu_007.csv")
        );
    }

    #[test]
    fn csv_has_header_gaps_and_one_decimal() {
        let mut table = TimeSeriesTable::default();
        table.push_row(100, [("total", 12.345), ("talker, /ns (42)", 3.0)]);
        table.push_row(101, [("python3 x.py (7)", 0.06)]);

        assert_eq!(
            to_csv(&table),
            "time,total,\"talker, /ns (42)\",python3 x.py (7)\n\
             100,12.3,3.0,\n\
             101,,,0.1\n"
        );
    }

    #[test]
    fn write_replaces_previous_chunk_contents() {
        let base = tempfile::tempdir().unwrap();
        let store = ChunkStore::create_in(base.path(), "run").unwrap();
        let mut table = TimeSeriesTable::default();
        table.push_row(1, [("a", 1.0)]);
        store.write_chunk("mem", 0, &table).unwrap();
        table.push_row(2, [("b", 2.0)]);
        let path = store.write_chunk("mem", 0, &table).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "time,a,b\n1,1.0,\n2,,2.0\n");
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn missing_directory_is_a_write_error() {
        let base = tempfile::tempdir().unwrap();
        let store = ChunkStore::create_in(base.path(), "run").unwrap();
        fs::remove_dir(store.dir()).unwrap();
        let err = store
            .write_chunk("cpu", 0, &TimeSeriesTable::default())
            .unwrap_err();
        assert!(matches!(err, PersistError::Write { .. }));
    }
}
