use crate::state::CpuTimesPercent;
use procfs::{CpuTime, KernelStats};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuJiffies {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuJiffies {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

impl From<&CpuTime> for CpuJiffies {
    fn from(time: &CpuTime) -> Self {
        Self {
            user: time.user,
            nice: time.nice,
            system: time.system,
            idle: time.idle,
            iowait: time.iowait.unwrap_or(0),
            irq: time.irq.unwrap_or(0),
            softirq: time.softirq.unwrap_or(0),
            steal: time.steal.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub total: CpuJiffies,
    pub cores: Vec<CpuJiffies>,
}

impl From<&KernelStats> for CpuStat {
    fn from(stats: &KernelStats) -> Self {
        Self {
            total: CpuJiffies::from(&stats.total),
            cores: stats.cpu_time.iter().map(CpuJiffies::from).collect(),
        }
    }
}

pub fn percent_between(previous: Option<&CpuJiffies>, current: &CpuJiffies) -> CpuTimesPercent {
    let base = previous.copied().unwrap_or_default();
    let delta = CpuJiffies {
        user: current.user.saturating_sub(base.user),
        nice: current.nice.saturating_sub(base.nice),
        system: current.system.saturating_sub(base.system),
        idle: current.idle.saturating_sub(base.idle),
        iowait: current.iowait.saturating_sub(base.iowait),
        irq: current.irq.saturating_sub(base.irq),
        softirq: current.softirq.saturating_sub(base.softirq),
        steal: current.steal.saturating_sub(base.steal),
    };

    let total = delta.total();
    if total == 0 {
        return CpuTimesPercent {
            idle: 100.0,
            ..CpuTimesPercent::default()
        };
    }
    let pct = |v: u64| v as f64 * 100.0 / total as f64;
    CpuTimesPercent {
        user: pct(delta.user),
        system: pct(delta.system),
        nice: pct(delta.nice),
        idle: pct(delta.idle),
        iowait: pct(delta.iowait),
        irq: pct(delta.irq),
        softirq: pct(delta.softirq),
        steal: pct(delta.steal),
    }
}
