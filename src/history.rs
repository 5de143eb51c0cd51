use crate::persist::{ChunkStore, PersistError};
use crate::state::TickSnapshot;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use tracing::info;

pub const TOTAL_COLUMN: &str = "total";

#[derive(Debug, Clone, Default)]
pub struct TimeSeriesTable {
    times: VecDeque<i64>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct Column {
    key: String,
    values: VecDeque<Option<f64>>,
}

impl TimeSeriesTable {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.key.as_str())
    }

    pub fn times(&self) -> impl Iterator<Item = i64> + '_ {
        self.times.iter().copied()
    }

    pub fn value(&self, row: usize, key: &str) -> Option<f64> {
        let column = self.index.get(key)?;
        self.columns[*column].values.get(row).copied().flatten()
    }

    pub fn row(&self, row: usize) -> Vec<Option<f64>> {
        self.columns
            .iter()
            .map(|c| c.values.get(row).copied().flatten())
            .collect()
    }

    pub fn push_row<'a>(&mut self, time: i64, cells: impl IntoIterator<Item = (&'a str, f64)>) {
        let rows_before = self.times.len();
        self.times.push_back(time);
        for column in &mut self.columns {
            column.values.push_back(None);
        }

        for (key, value) in cells {
            let idx = match self.index.get(key) {
                Some(idx) => *idx,
                None => {
                    let mut values = VecDeque::with_capacity(rows_before + 1);
                    values.resize(rows_before + 1, None);
                    self.columns.push(Column {
                        key: key.to_string(),
                        values,
                    });
                    self.index.insert(key.to_string(), self.columns.len() - 1);
                    self.columns.len() - 1
                }
            };
            if let Some(cell) = self.columns[idx].values.back_mut() {
                *cell = Some(value);
            }
        }
    }

    pub fn evict_front(&mut self) {
        if self.times.pop_front().is_some() {
            for column in &mut self.columns {
                column.values.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.columns.clear();
        self.index.clear();
    }

    fn latest(&self, column: &Column) -> Option<f64> {
        column
            .values
            .back()
            .copied()
            .flatten()
            .filter(|v| !v.is_nan())
    }

    pub fn ordered(&self) -> TimeSeriesTable {
        let mut order: Vec<usize> = (0..self.columns.len()).collect();
        order.sort_by(|a, b| {
            let a = self.latest(&self.columns[*a]);
            let b = self.latest(&self.columns[*b]);
            match (a, b) {
                (Some(a), Some(b)) => b.total_cmp(&a),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        if let Some(pos) = order.iter().position(|i| self.columns[*i].key == TOTAL_COLUMN) {
            let total = order.remove(pos);
            order.insert(0, total);
        }

        let columns: Vec<Column> = order.into_iter().map(|i| self.columns[i].clone()).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.key.clone(), i))
            .collect();
        TimeSeriesTable {
            times: self.times.clone(),
            columns,
            index,
        }
    }

    pub fn view(&self) -> TableView {
        TableView {
            columns: self.columns().map(str::to_string).collect(),
            rows: (0..self.len())
                .map(|i| RowView {
                    time: self.times[i],
                    values: self.row(i),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableView {
    pub columns: Vec<String>,
    pub rows: Vec<RowView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowView {
    pub time: i64,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryTables {
    pub cpu: TimeSeriesTable,
    pub mem: TimeSeriesTable,
}

#[derive(Debug)]
pub struct Recorded {
    pub tables: HistoryTables,
    pub persist_error: Option<PersistError>,
}

struct Chunks {
    store: ChunkStore,
    rows: usize,
    index: usize,
    cpu: TimeSeriesTable,
    mem: TimeSeriesTable,
}

pub struct Aggregator {
    live_rows: usize,
    cpu: TimeSeriesTable,
    mem: TimeSeriesTable,
    chunks: Option<Chunks>,
}

impl Aggregator {
    pub fn new(live_rows: usize) -> Self {
        Self {
            live_rows: live_rows.max(1),
            cpu: TimeSeriesTable::default(),
            mem: TimeSeriesTable::default(),
            chunks: None,
        }
    }

    pub fn with_store(live_rows: usize, store: ChunkStore, chunk_rows: usize) -> Self {
        Self {
            chunks: Some(Chunks {
                store,
                rows: chunk_rows.max(1),
                index: 0,
                cpu: TimeSeriesTable::default(),
                mem: TimeSeriesTable::default(),
            }),
            ..Self::new(live_rows)
        }
    }

    pub fn record(&mut self, snapshot: &TickSnapshot) -> Recorded {
        let keys: Vec<String> = snapshot.processes.iter().map(|p| p.identity_key()).collect();
        let total = snapshot.system.as_ref().map(|s| s.total_cpu_percent());

        let cpu_cells = || {
            total
                .map(|t| (TOTAL_COLUMN, t))
                .into_iter()
                .chain(
                    keys.iter()
                        .zip(&snapshot.processes)
                        .map(|(k, p)| (k.as_str(), p.cpu_percent)),
                )
        };
        let mem_cells = || {
            keys.iter()
                .zip(&snapshot.processes)
                .map(|(k, p)| (k.as_str(), p.memory_percent))
        };

        self.cpu.push_row(snapshot.timestamp, cpu_cells());
        self.mem.push_row(snapshot.timestamp, mem_cells());
        while self.cpu.len() > self.live_rows {
            self.cpu.evict_front();
        }
        while self.mem.len() > self.live_rows {
            self.mem.evict_front();
        }

        let mut persist_error = None;
        if let Some(chunks) = &mut self.chunks {
            chunks.cpu.push_row(snapshot.timestamp, cpu_cells());
            chunks.mem.push_row(snapshot.timestamp, mem_cells());
            persist_error = chunks.flush().err();
        }

        Recorded {
            tables: self.tables(),
            persist_error,
        }
    }

    pub fn reset(&mut self) {
        self.cpu.clear();
        self.mem.clear();
        info!("live history cleared");
    }

    pub fn tables(&self) -> HistoryTables {
        HistoryTables {
            cpu: self.cpu.ordered(),
            mem: self.mem.ordered(),
        }
    }

    pub fn live_rows(&self) -> usize {
        self.cpu.len()
    }

    pub fn chunk_index(&self) -> Option<usize> {
        self.chunks.as_ref().map(|c| c.index)
    }
}

impl Chunks {
    fn flush(&mut self) -> Result<(), PersistError> {
        let written = self
            .store
            .write_chunk("cpu", self.index, &self.cpu)
            .and_then(|_| self.store.write_chunk("mem", self.index, &self.mem))
            .map(|_| ());

        if self.cpu.len() >= self.rows {
            self.cpu.clear();
            self.mem.clear();
            self.index += 1;
            info!(chunk = self.index, dir = %self.store.dir().display(), "rotated to new chunk");
        }
        written
    }
}
