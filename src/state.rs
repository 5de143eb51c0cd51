use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Unknown,
}

impl ProcessStatus {
    pub fn as_char(self) -> char {
        match self {
            ProcessStatus::Running => 'R',
            ProcessStatus::Sleeping => 'S',
            ProcessStatus::Stopped => 'T',
            ProcessStatus::Zombie => 'Z',
            ProcessStatus::Unknown => 'X',
        }
    }

    pub fn from_state_char(c: char) -> Self {
        match c {
            'R' => ProcessStatus::Running,
            'S' | 'I' | 'D' => ProcessStatus::Sleeping,
            'T' | 't' => ProcessStatus::Stopped,
            'Z' => ProcessStatus::Zombie,
            _ => ProcessStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub username: String,
    pub status: ProcessStatus,
    pub virtual_memory_kib: u64,
    pub resident_memory_kib: u64,
    pub shared_memory_kib: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub cpu_time_secs: f64,
    pub display_name: String,
}

impl ProcessRecord {
    pub fn new(pid: u32, display_name: impl Into<String>) -> Self {
        Self {
            pid,
            username: String::new(),
            status: ProcessStatus::Unknown,
            virtual_memory_kib: 0,
            resident_memory_kib: 0,
            shared_memory_kib: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            cpu_time_secs: 0.0,
            display_name: display_name.into(),
        }
    }

    pub fn identity_key(&self) -> String {
        identity_key(&self.display_name, self.pid)
    }
}

pub fn identity_key(display_name: &str, pid: u32) -> String {
    format!("{display_name} ({pid})")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuTimesPercent {
    pub user: f64,
    pub system: f64,
    pub nice: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreMetrics {
    pub frequency_mhz: u64,
    pub times: CpuTimesPercent,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub running: usize,
    pub sleeping: usize,
    pub stopped: usize,
    pub zombie: usize,
}

impl TaskSummary {
    pub fn tally<'a>(total: usize, records: impl IntoIterator<Item = &'a ProcessRecord>) -> Self {
        let mut summary = TaskSummary {
            total,
            ..TaskSummary::default()
        };
        for record in records {
            match record.status {
                ProcessStatus::Running => summary.running += 1,
                ProcessStatus::Sleeping => summary.sleeping += 1,
                ProcessStatus::Stopped => summary.stopped += 1,
                ProcessStatus::Zombie => summary.zombie += 1,
                ProcessStatus::Unknown => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemorySummary {
    pub total_mib: f64,
    pub free_mib: f64,
    pub used_mib: f64,
    pub buff_cache_mib: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SwapSummary {
    pub total_mib: f64,
    pub free_mib: f64,
    pub used_mib: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub load_average: LoadAverage,
    pub uptime_secs: u64,
    pub tasks: TaskSummary,
    pub cpu: CpuTimesPercent,
    pub cores: Vec<CoreMetrics>,
    pub memory: MemorySummary,
    pub swap: SwapSummary,
}

impl SystemSummary {
    pub fn total_cpu_percent(&self) -> f64 {
        if self.cores.is_empty() {
            return 100.0 - self.cpu.idle;
        }
        self.cores.iter().map(|c| 100.0 - c.times.idle).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TextReport {
    pub compact: Vec<String>,
    pub full: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSnapshot {
    pub timestamp: i64,
    pub system: Option<SystemSummary>,
    pub processes: Vec<ProcessRecord>,
    pub text: Option<TextReport>,
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, status: ProcessStatus) -> ProcessRecord {
        ProcessRecord {
            status,
            ..ProcessRecord::new(pid, "proc")
        }
    }

    #[test]
    fn identity_key_combines_name_and_pid() {
        let r = ProcessRecord::new(42, "talker, /ns");
        assert_eq!(r.identity_key(), "talker, /ns (42)");
    }

    #[test]
    fn tally_counts_states_but_keeps_total() {
        let records = vec![
            record(1, ProcessStatus::Running),
            record(2, ProcessStatus::Sleeping),
            record(3, ProcessStatus::Sleeping),
            record(4, ProcessStatus::Zombie),
            record(5, ProcessStatus::Unknown),
        ];
        let tasks = TaskSummary::tally(40, &records);
        assert_eq!(tasks.total, 40);
        assert_eq!(tasks.running, 1);
        assert_eq!(tasks.sleeping, 2);
        assert_eq!(tasks.stopped, 0);
        assert_eq!(tasks.zombie, 1);
    }

    #[test]
    fn total_cpu_sums_busy_share_of_each_core() {
        let core = |idle| CoreMetrics {
            frequency_mhz: 0,
            times: CpuTimesPercent {
                idle,
                ..CpuTimesPercent::default()
            },
        };
        let summary = SystemSummary {
            load_average: LoadAverage::default(),
            uptime_secs: 0,
            tasks: TaskSummary::default(),
            cpu: CpuTimesPercent {
                idle: 70.0,
                ..CpuTimesPercent::default()
            },
            cores: vec![core(90.0), core(50.0)],
            memory: MemorySummary::default(),
            swap: SwapSummary::default(),
        };
        assert!((summary.total_cpu_percent() - 60.0).abs() < 1e-9);

        let no_cores = SystemSummary {
            cores: Vec::new(),
            ..summary
        };
        assert!((no_cores.total_cpu_percent() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn state_char_round_trips_for_known_states() {
        for status in [
            ProcessStatus::Running,
            ProcessStatus::Sleeping,
            ProcessStatus::Stopped,
            ProcessStatus::Zombie,
        ] {
            assert_eq!(ProcessStatus::from_state_char(status.as_char()), status);
        }
        assert_eq!(ProcessStatus::from_state_char('?'), ProcessStatus::Unknown);
    }
}
