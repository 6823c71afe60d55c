//! CPU and memory readings from procfs.

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcReading {
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
}

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

struct StatFields {
    state: char,
    cpu_ticks: u64,
}

fn parse_stat(s: &str) -> Option<StatFields> {
    // comm may contain spaces and parens; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let state = parts.first()?.chars().next()?;
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(StatFields {
        state,
        cpu_ticks: utime.saturating_add(stime),
    })
}

fn parse_statm_resident_pages(s: &str) -> Option<u64> {
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    it.next()?.parse().ok()
}

/// `None` once the process is gone or only a zombie is left.
#[cfg(target_os = "linux")]
pub async fn read(pid: u32) -> Option<ProcReading> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    let fields = parse_stat(&stat)?;
    if matches!(fields.state, 'Z' | 'X' | 'x') {
        return None;
    }
    let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let resident = parse_statm_resident_pages(&statm)?;
    Some(ProcReading {
        cpu_ticks: fields.cpu_ticks,
        rss_bytes: resident.saturating_mul(page_size()),
    })
}

#[cfg(not(target_os = "linux"))]
pub async fn read(_pid: u32) -> Option<ProcReading> {
    None
}

/// CPU utilisation between two readings, in percent of one core.
pub fn cpu_percent(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}
