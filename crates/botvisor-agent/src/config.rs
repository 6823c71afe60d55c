use std::{path::PathBuf, time::Duration};

const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 50 * 1024 * 1024; // 50 MiB
const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 200 * 1024 * 1024; // 200 MiB
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 1024 * 1024; // 1 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 1;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_bool(name: &str, default_value: bool) -> bool {
    match std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

#[derive(Clone, Debug)]
pub struct RestartTuning {
    /// Restarts allowed inside `window` before the controller gives up.
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    pub workers: usize,
}

impl Default for RestartTuning {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(600),
            backoff_ms: 1000,
            backoff_max_ms: 60_000,
            workers: 4,
        }
    }
}

impl RestartTuning {
    fn from_env() -> Self {
        let d = Self::default();
        let backoff_ms = env_u64("BOTVISOR_RESTART_BACKOFF_MS")
            .map(|v| v.clamp(10, 10 * 60 * 1000))
            .unwrap_or(d.backoff_ms);
        Self {
            max_restarts: env_u64("BOTVISOR_RESTART_MAX")
                .map(|v| v.clamp(0, 1000) as u32)
                .unwrap_or(d.max_restarts),
            window: env_u64("BOTVISOR_RESTART_WINDOW_SEC")
                .map(|v| Duration::from_secs(v.clamp(10, 24 * 60 * 60)))
                .unwrap_or(d.window),
            backoff_ms,
            backoff_max_ms: env_u64("BOTVISOR_RESTART_BACKOFF_MAX_MS")
                .map(|v| v.clamp(backoff_ms, 60 * 60 * 1000))
                .unwrap_or(d.backoff_max_ms.max(backoff_ms)),
            workers: env_usize("BOTVISOR_RESTART_WORKERS")
                .map(|v| v.clamp(1, 64))
                .unwrap_or(d.workers),
        }
    }

    /// Exponential backoff; `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(mult).min(self.backoff_max_ms))
    }
}

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub no_new_privs: bool,
    /// 0 disables the limit.
    pub nofile_limit: u64,
    pub enable_cgroups: bool,
    pub cgroup_root: PathBuf,
    pub cgroup_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            no_new_privs: true,
            nofile_limit: 1024,
            enable_cgroups: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_prefix: "botvisor.bot".to_string(),
        }
    }
}

impl SandboxConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            no_new_privs: env_bool("BOTVISOR_SANDBOX_NO_NEW_PRIVS", d.no_new_privs),
            nofile_limit: env_u64("BOTVISOR_SANDBOX_NOFILE")
                .map(|v| if v == 0 { 0 } else { v.clamp(64, 1 << 20) })
                .unwrap_or(d.nofile_limit),
            enable_cgroups: env_bool("BOTVISOR_SANDBOX_ENABLE_CGROUPS", d.enable_cgroups),
            cgroup_root: env_string("BOTVISOR_SANDBOX_CGROUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.cgroup_root),
            cgroup_prefix: env_string("BOTVISOR_SANDBOX_CGROUP_PREFIX").unwrap_or(d.cgroup_prefix),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    /// Interpreter used to run the entry point, e.g. `python3`.
    pub runtime: String,
    pub entry_point: String,
    pub credential_env: String,

    pub max_archive_bytes: u64,
    pub max_extracted_bytes: u64,
    pub max_archive_entries: usize,

    /// A child that exits inside this window never reaches `running`.
    pub launch_probe: Duration,
    pub stop_grace: Duration,
    pub kill_confirm: Duration,

    pub sample_interval: Duration,
    pub sample_history: usize,

    pub restart: RestartTuning,

    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,

    pub plans_file: Option<PathBuf>,
    pub prelaunch_cmd: Option<Vec<String>>,
    pub prelaunch_timeout: Duration,

    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            runtime: "python3".to_string(),
            entry_point: "main.py".to_string(),
            credential_env: "BOT_TOKEN".to_string(),
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
            max_archive_entries: 10_000,
            launch_probe: Duration::from_millis(300),
            stop_grace: Duration::from_secs(10),
            kill_confirm: Duration::from_secs(5),
            sample_interval: Duration::from_millis(2000),
            sample_history: 30,
            restart: RestartTuning::default(),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            plans_file: None,
            prelaunch_cmd: None,
            prelaunch_timeout: Duration::from_secs(300),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_root: env_string("BOTVISOR_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.data_root),
            runtime: env_string("BOTVISOR_RUNTIME").unwrap_or(d.runtime),
            entry_point: env_string("BOTVISOR_ENTRY_POINT").unwrap_or(d.entry_point),
            credential_env: env_string("BOTVISOR_CREDENTIAL_ENV").unwrap_or(d.credential_env),
            max_archive_bytes: env_u64("BOTVISOR_MAX_ARCHIVE_BYTES")
                .map(|v| v.clamp(1024, 1024 * 1024 * 1024))
                .unwrap_or(d.max_archive_bytes),
            max_extracted_bytes: env_u64("BOTVISOR_MAX_EXTRACTED_BYTES")
                .map(|v| v.clamp(1024, 8 * 1024 * 1024 * 1024))
                .unwrap_or(d.max_extracted_bytes),
            max_archive_entries: env_usize("BOTVISOR_MAX_ARCHIVE_ENTRIES")
                .map(|v| v.clamp(1, 1_000_000))
                .unwrap_or(d.max_archive_entries),
            launch_probe: env_u64("BOTVISOR_LAUNCH_PROBE_MS")
                .map(|v| Duration::from_millis(v.clamp(0, 10_000)))
                .unwrap_or(d.launch_probe),
            stop_grace: env_u64("BOTVISOR_STOP_GRACE_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 120)))
                .unwrap_or(d.stop_grace),
            kill_confirm: env_u64("BOTVISOR_KILL_CONFIRM_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 60)))
                .unwrap_or(d.kill_confirm),
            sample_interval: env_u64("BOTVISOR_SAMPLE_INTERVAL_MS")
                .map(|v| Duration::from_millis(v.clamp(250, 60_000)))
                .unwrap_or(d.sample_interval),
            sample_history: env_usize("BOTVISOR_SAMPLE_HISTORY")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(d.sample_history),
            restart: RestartTuning::from_env(),
            log_max_lines: env_usize("BOTVISOR_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
            log_file_max_bytes: env_u64("BOTVISOR_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.log_file_max_bytes),
            log_file_max_files: env_usize("BOTVISOR_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(d.log_file_max_files),
            plans_file: env_string("BOTVISOR_PLANS_FILE").map(PathBuf::from),
            prelaunch_cmd: env_string("BOTVISOR_PRELAUNCH_CMD")
                .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .filter(|v| !v.is_empty()),
            prelaunch_timeout: env_u64("BOTVISOR_PRELAUNCH_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(10, 3600)))
                .unwrap_or(d.prelaunch_timeout),
            sandbox: SandboxConfig::from_env(),
        }
    }

    pub fn bots_dir(&self) -> PathBuf {
        self.data_root.join("bots")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_root.join("records")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}
