use crate::state::{CpuTimesPercent, ProcessRecord, SystemSummary, TickSnapshot};
use chrono::{Local, TimeZone};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub wide: bool,
    pub per_core: bool,
}

pub fn render(snapshot: &TickSnapshot, options: RenderOptions) -> Vec<String> {
    if let Some(text) = &snapshot.text {
        return if options.wide {
            text.full.clone()
        } else {
            text.compact.clone()
        };
    }

    let mut lines = Vec::with_capacity(snapshot.processes.len() + 8);
    if let Some(system) = &snapshot.system {
        lines.extend(summary_lines(snapshot.timestamp, system, options.per_core));
        lines.push(String::new());
    }
    lines.push(header(options.wide));
    lines.extend(snapshot.processes.iter().map(|p| process_line(p, options.wide)));
    lines
}

fn summary_lines(timestamp: i64, system: &SystemSummary, per_core: bool) -> Vec<String> {
    let now = Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let load = &system.load_average;
    let tasks = &system.tasks;

    let mut lines = vec![
        format!(
            "top - {now} up {}, load average: {:.2}, {:.2}, {:.2}",
            format_uptime(system.uptime_secs),
            load.one,
            load.five,
            load.fifteen
        ),
        format!(
            "Tasks:{:4} total,{:4} running,{:4} sleeping,{:4} stopped,{:4} zombie",
            tasks.total, tasks.running, tasks.sleeping, tasks.stopped, tasks.zombie
        ),
    ];

    if per_core && !system.cores.is_empty() {
        for (idx, core) in system.cores.iter().enumerate() {
            let label = format!("%Cpu{idx:<3}({:4}):", core.frequency_mhz);
            lines.push(cpu_line(&label, &core.times));
        }
    } else {
        lines.push(cpu_line("%Cpu(s):", &system.cpu));
    }

    let mem = &system.memory;
    lines.push(format!(
        "MiB Mem :{:9.1} total,{:9.1} free,{:9.1} used,{:9.1} buff/cache",
        mem.total_mib, mem.free_mib, mem.used_mib, mem.buff_cache_mib
    ));
    let swap = &system.swap;
    lines.push(format!(
        "MiB Swap:{:9.1} total,{:9.1} free,{:9.1} used",
        swap.total_mib, swap.free_mib, swap.used_mib
    ));
    lines
}

fn cpu_line(label: &str, t: &CpuTimesPercent) -> String {
    format!(
        "{label}{:5.1} us,{:5.1} sy,{:5.1} ni,{:5.1} id,{:5.1} wa,{:5.1} hi,{:5.1} si,{:5.1} st",
        t.user, t.system, t.nice, t.idle, t.iowait, t.irq, t.softirq, t.steal
    )
}

fn header(wide: bool) -> String {
    let mut line = format!("{:>7} {:<8} ", "PID", "USER");
    if wide {
        let _ = write!(line, "{:>8} {:>8} {:>8} S ", "VIRT", "RES", "SHR");
    }
    let _ = write!(line, "{:>5} {:>5} {:>9} COMMAND", "%CPU", "%MEM", "TIME+");
    line
}

fn process_line(p: &ProcessRecord, wide: bool) -> String {
    let user: String = p.username.chars().take(8).collect();
    let mut line = format!("{:>7} {:<8} ", p.pid, user);
    if wide {
        let _ = write!(
            line,
            "{:>8} {:>8} {:>8} {} ",
            p.virtual_memory_kib,
            p.resident_memory_kib,
            p.shared_memory_kib,
            p.status.as_char()
        );
    }
    let _ = write!(
        line,
        "{:5.1} {:5.1} {:>9} {}",
        p.cpu_percent,
        p.memory_percent,
        format_cpu_time(p.cpu_time_secs),
        p.display_name
    );
    line
}

pub fn format_cpu_time(secs: f64) -> String {
    let hundredths = (secs.max(0.0) * 100.0).round() as u64;
    let minutes = hundredths / 6000;
    let seconds = (hundredths / 100) % 60;
    format!("{minutes}:{seconds:02}.{:02}", hundredths % 100)
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hms = format!("{}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    match days {
        0 => hms,
        1 => format!("1 day, {hms}"),
        n => format!("{n} days, {hms}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        CoreMetrics, LoadAverage, MemorySummary, ProcessStatus, SwapSummary, TaskSummary,
        TextReport,
    };

    fn system() -> SystemSummary {
        SystemSummary {
            load_average: LoadAverage {
                one: 0.5,
                five: 0.25,
                fifteen: 0.1,
            },
            uptime_secs: 90_061,
            tasks: TaskSummary {
                total: 200,
                running: 2,
                sleeping: 30,
                stopped: 0,
                zombie: 1,
            },
            cpu: CpuTimesPercent {
                user: 3.0,
                system: 1.0,
                idle: 95.0,
                steal: 0.5,
                ..CpuTimesPercent::default()
            },
            cores: vec![
                CoreMetrics {
                    frequency_mhz: 2400,
                    times: CpuTimesPercent {
                        idle: 90.0,
                        ..CpuTimesPercent::default()
                    },
                },
                CoreMetrics {
                    frequency_mhz: 800,
                    times: CpuTimesPercent {
                        idle: 100.0,
                        ..CpuTimesPercent::default()
                    },
                },
            ],
            memory: MemorySummary {
                total_mib: 16000.0,
                free_mib: 8000.0,
                used_mib: 4000.0,
                buff_cache_mib: 4000.0,
            },
            swap: SwapSummary::default(),
        }
    }

    fn snapshot() -> TickSnapshot {
        TickSnapshot {
            timestamp: 0,
            system: Some(system()),
            processes: vec![ProcessRecord {
                username: "averyverylongname".into(),
                status: ProcessStatus::Running,
                virtual_memory_kib: 1000,
                resident_memory_kib: 500,
                shared_memory_kib: 100,
                cpu_percent: 12.34,
                memory_percent: 0.5,
                cpu_time_secs: 75.5,
                ..ProcessRecord::new(4242, "python3 talker.py")
            }],
            text: None,
        }
    }

    #[test]
    fn renders_summary_header_and_rows() {
        let lines = render(&snapshot(), RenderOptions::default());
        assert!(lines[0].starts_with("top - "));
        assert!(lines[0].ends_with("up 1 day, 1:01:01, load average: 0.50, 0.25, 0.10"));
        assert_eq!(lines[1], "Tasks: 200 total,   2 running,  30 sleeping,   0 stopped,   1 zombie");
        assert_eq!(
            lines[2],
            "%Cpu(s):  3.0 us,  1.0 sy,  0.0 ni, 95.0 id,  0.0 wa,  0.0 hi,  0.0 si,  0.5 st"
        );
        assert_eq!(
            lines[3],
            "MiB Mem :  16000.0 total,   8000.0 free,   4000.0 used,   4000.0 buff/cache"
        );
        assert!(lines[4].starts_with("MiB Swap:"));
        assert_eq!(lines[5], "");
        assert_eq!(lines[6], "    PID USER      %CPU  %MEM     TIME+ COMMAND");
        assert_eq!(lines[7], "   4242 averyver  12.3   0.5   1:15.50 python3 talker.py");
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn wide_and_per_core_variants() {
        let lines = render(
            &snapshot(),
            RenderOptions {
                wide: true,
                per_core: true,
            },
        );
        assert!(lines[2].starts_with("%Cpu0  (2400):"));
        assert!(lines[3].starts_with("%Cpu1  ( 800):"));
        let header = lines.iter().find(|l| l.contains("PID")).unwrap();
        assert!(header.contains("VIRT") && header.contains(" S "));
        let row = lines.last().unwrap();
        assert!(row.contains("    1000      500      100 R "));
    }

    #[test]
    fn text_snapshots_pass_through() {
        let snapshot = TickSnapshot {
            timestamp: 0,
            system: None,
            processes: Vec::new(),
            text: Some(TextReport {
                compact: vec!["compact".into()],
                full: vec!["full".into()],
            }),
        };
        assert_eq!(render(&snapshot, RenderOptions::default()), vec!["compact"]);
        let wide = RenderOptions {
            wide: true,
            ..RenderOptions::default()
        };
        assert_eq!(render(&snapshot, wide), vec!["full"]);
    }

    #[test]
    fn time_formats() {
        assert_eq!(format_cpu_time(0.0), "0:00.00");
        assert_eq!(format_cpu_time(7384.56), "123:04.56");
        assert_eq!(format_uptime(59), "0:00:59");
        assert_eq!(format_uptime(3 * 86_400 + 3600), "3 days, 1:00:00");
    }
}
