use crate::collectors::classify::classify;
use crate::collectors::filter::ProcessFilter;
use crate::collectors::procstat::{percent_between, CpuStat};
use crate::collectors::{rank_by_cpu, CollectError, Collector};
use crate::state::{
    now_unix, CoreMetrics, LoadAverage, MemorySummary, ProcessRecord, ProcessStatus,
    SwapSummary, SystemSummary, TaskSummary, TickSnapshot,
};
use std::collections::HashSet;
use sysinfo::{
    CpuExt, Pid, PidExt, Process, ProcessExt, ProcessStatus as SysStatus, System, SystemExt,
    UserExt,
};
use procfs::{Current, CurrentSI, KernelStats, Meminfo};
use tracing::debug;

const BYTES_PER_KIB: u64 = 1024;
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

struct TrackedProcess {
    pid: Pid,
    handle: Option<procfs::process::Process>,
}

impl TrackedProcess {
    fn open(pid: Pid) -> Self {
        let handle = match procfs::process::Process::new(pid.as_u32() as i32) {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(pid = pid.as_u32(), error = %err, "no procfs handle");
                None
            }
        };
        Self { pid, handle }
    }

    fn shared_memory_kib(&self, page_size: u64) -> u64 {
        self.handle
            .as_ref()
            .and_then(|h| h.statm().ok())
            .map(|statm| statm.shared * page_size / BYTES_PER_KIB)
            .unwrap_or(0)
    }

    fn cpu_time_secs(&self, ticks_per_second: u64) -> f64 {
        if ticks_per_second == 0 {
            return 0.0;
        }
        self.handle
            .as_ref()
            .and_then(|h| h.stat().ok())
            .map(|stat| (stat.utime + stat.stime) as f64 / ticks_per_second as f64)
            .unwrap_or(0.0)
    }
}

pub struct NativeCollector {
    system: System,
    filter: ProcessFilter,
    num_process: usize,
    tracked: Vec<TrackedProcess>,
    previous_cpu: Option<CpuStat>,
    page_size: u64,
    ticks_per_second: u64,
}

impl NativeCollector {
    pub fn new(filter: ProcessFilter, num_process: usize) -> Self {
        let mut system = System::new();
        system.refresh_users_list();
        system.refresh_memory();
        system.refresh_cpu();

        Self {
            system,
            filter,
            num_process,
            tracked: Vec::new(),
            previous_cpu: None,
            page_size: procfs::page_size(),
            ticks_per_second: procfs::ticks_per_second(),
        }
    }

    fn update_tracked(&mut self) {
        self.system.refresh_processes();
        let current: HashSet<Pid> = self.system.processes().keys().copied().collect();

        self.tracked.retain(|t| current.contains(&t.pid));
        let known: HashSet<Pid> = self.tracked.iter().map(|t| t.pid).collect();

        let mut added: Vec<Pid> = current.difference(&known).copied().collect();
        added.sort_by_key(|pid| pid.as_u32());
        if !added.is_empty() {
            debug!(added = added.len(), tracked = current.len(), "process table changed");
        }
        self.tracked.extend(added.into_iter().map(TrackedProcess::open));
    }

    fn read_process(
        &self,
        tracked: &TrackedProcess,
        process: &Process,
        total_memory: u64,
    ) -> Option<ProcessRecord> {
        let name = process.name();
        let name = if name.is_empty() {
            tracked.pid.as_u32().to_string()
        } else {
            name.to_string()
        };
        let args = process.cmd();
        let command_line = if args.is_empty() {
            name.clone()
        } else {
            args.join(" ")
        };
        if !self.filter.accepts(&command_line) {
            return None;
        }

        let username = process
            .user_id()
            .and_then(|uid| self.system.get_user_by_id(uid))
            .map(|user| user.name().to_string())
            .unwrap_or_default();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            process.memory() as f64 * 100.0 / total_memory as f64
        };

        Some(ProcessRecord {
            pid: tracked.pid.as_u32(),
            username,
            status: status_of(process.status()),
            virtual_memory_kib: process.virtual_memory() / BYTES_PER_KIB,
            resident_memory_kib: process.memory() / BYTES_PER_KIB,
            shared_memory_kib: tracked.shared_memory_kib(self.page_size),
            cpu_percent: process.cpu_usage() as f64,
            memory_percent,
            cpu_time_secs: tracked.cpu_time_secs(self.ticks_per_second),
            display_name: classify(&name, args),
        })
    }

    fn system_summary(&mut self, tasks: TaskSummary) -> Result<SystemSummary, CollectError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let stats = KernelStats::current().map_err(|source| CollectError::SystemStats {
            path: "/proc/stat",
            source,
        })?;
        let stat = CpuStat::from(&stats);
        let meminfo = Meminfo::current().map_err(|source| CollectError::SystemStats {
            path: "/proc/meminfo",
            source,
        })?;
        let buff_cache_bytes =
            meminfo.buffers + meminfo.cached + meminfo.s_reclaimable.unwrap_or(0);

        let previous = self.previous_cpu.as_ref();
        let cpu = percent_between(previous.map(|p| &p.total), &stat.total);
        let cpus = self.system.cpus();
        let cores = stat
            .cores
            .iter()
            .enumerate()
            .map(|(idx, core)| CoreMetrics {
                frequency_mhz: cpus.get(idx).map(|c| c.frequency()).unwrap_or(0),
                times: percent_between(previous.and_then(|p| p.cores.get(idx)), core),
            })
            .collect();
        self.previous_cpu = Some(stat);

        let load = self.system.load_average();
        let to_mib = |bytes: u64| bytes as f64 / BYTES_PER_MIB;

        Ok(SystemSummary {
            load_average: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
            uptime_secs: self.system.uptime(),
            tasks,
            cpu,
            cores,
            memory: MemorySummary {
                total_mib: to_mib(self.system.total_memory()),
                free_mib: to_mib(self.system.free_memory()),
                used_mib: to_mib(self.system.used_memory()),
                buff_cache_mib: to_mib(buff_cache_bytes),
            },
            swap: SwapSummary {
                total_mib: to_mib(self.system.total_swap()),
                free_mib: to_mib(self.system.free_swap()),
                used_mib: to_mib(self.system.used_swap()),
            },
        })
    }
}

impl Collector for NativeCollector {
    fn sample(&mut self) -> Result<Option<TickSnapshot>, CollectError> {
        self.update_tracked();
        if self.tracked.is_empty() {
            return Err(CollectError::NoProcessTable);
        }

        let total_memory = self.system.total_memory();
        let mut visible = Vec::new();
        for tracked in &self.tracked {
            let Some(process) = self.system.process(tracked.pid) else {
                continue;
            };
            if let Some(record) = self.read_process(tracked, process, total_memory) {
                visible.push(record);
            }
        }

        let tasks = TaskSummary::tally(self.tracked.len(), &visible);
        let processes = rank_by_cpu(visible, self.num_process);
        let system = self.system_summary(tasks)?;

        Ok(Some(TickSnapshot {
            timestamp: now_unix(),
            system: Some(system),
            processes,
            text: None,
        }))
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

fn status_of(status: SysStatus) -> ProcessStatus {
    match status {
        SysStatus::Run => ProcessStatus::Running,
        SysStatus::Sleep | SysStatus::Idle => ProcessStatus::Sleeping,
        SysStatus::Stop | SysStatus::Tracing => ProcessStatus::Stopped,
        SysStatus::Zombie => ProcessStatus::Zombie,
        _ => ProcessStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(pattern: &str, limit: usize) -> NativeCollector {
        NativeCollector::new(ProcessFilter::new(pattern, false).unwrap(), limit)
    }

    #[test]
    fn samples_include_current_process() {
        let mut c = collector(".*", usize::MAX);
        c.sample().unwrap();
        let snapshot = c.sample().unwrap().expect("native backend always yields");
        let me = std::process::id();
        let record = snapshot
            .processes
            .iter()
            .find(|r| r.pid == me)
            .expect("own process is visible");
        assert!(record.resident_memory_kib > 0);
        assert!(!record.display_name.is_empty());

        let system = snapshot.system.expect("system summary present");
        assert!(system.tasks.total >= snapshot.processes.len());
        assert!(system.memory.total_mib > 0.0);
        assert!(!system.cores.is_empty());
    }

    #[test]
    fn processes_are_sorted_and_capped() {
        let mut c = collector(".*", 5);
        let snapshot = c.sample().unwrap().unwrap();
        assert!(snapshot.processes.len() <= 5);
        assert!(snapshot
            .processes
            .windows(2)
            .all(|w| w[0].cpu_percent >= w[1].cpu_percent));
    }

    #[test]
    fn filter_hides_processes_but_total_counts_them() {
        let mut c = collector("no-process-is-called-this-9f3a", 30);
        let snapshot = c.sample().unwrap().unwrap();
        assert!(snapshot.processes.is_empty());
        let tasks = snapshot.system.unwrap().tasks;
        assert!(tasks.total > 0);
        assert_eq!(tasks.running + tasks.sleeping + tasks.stopped + tasks.zombie, 0);
    }

    #[test]
    fn tracked_set_follows_process_table() {
        let mut c = collector(".*", 30);
        c.sample().unwrap();
        let first = c.tracked.len();
        assert!(first > 0);
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        c.sample().unwrap();
        let pid = Pid::from_u32(child.id());
        assert!(c.tracked.iter().any(|t| t.pid == pid));
        child.kill().unwrap();
        child.wait().unwrap();
        c.sample().unwrap();
        assert!(!c.tracked.iter().any(|t| t.pid == pid));
    }

    #[test]
    fn maps_kernel_states() {
        assert_eq!(status_of(SysStatus::Run), ProcessStatus::Running);
        assert_eq!(status_of(SysStatus::Idle), ProcessStatus::Sleeping);
        assert_eq!(status_of(SysStatus::Tracing), ProcessStatus::Stopped);
        assert_eq!(status_of(SysStatus::Zombie), ProcessStatus::Zombie);
        assert_eq!(status_of(SysStatus::Dead), ProcessStatus::Unknown);
    }
}
