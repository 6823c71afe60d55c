use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use botvisor_process::{BotId, Credential, Plan};

use crate::config::SandboxConfig;

/// Variables passed through from the supervisor's own environment.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ"];

#[derive(Clone, Debug)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub cpu_millicores: u64,
    pub nofile_limit: u64,
    pub no_new_privs: bool,
}

impl SandboxLimits {
    pub fn for_plan(plan: &Plan, cfg: &SandboxConfig) -> Self {
        Self {
            memory_bytes: plan.max_ram_mb.saturating_mul(1024 * 1024),
            cpu_millicores: u64::from(plan.max_cpu_percent).saturating_mul(10),
            nofile_limit: cfg.nofile_limit,
            no_new_privs: cfg.no_new_privs,
        }
    }

    pub fn summary(&self) -> String {
        let mem_mb = if self.memory_bytes == 0 {
            "unlimited".to_string()
        } else {
            format!("{}MiB", self.memory_bytes / (1024 * 1024))
        };
        let nofile = if self.nofile_limit == 0 {
            "unlimited".to_string()
        } else {
            self.nofile_limit.to_string()
        };
        let cpu = if self.cpu_millicores == 0 {
            "unlimited".to_string()
        } else {
            format!("{}m", self.cpu_millicores)
        };

        format!("mem={mem_mb} nofile={nofile} cpu={cpu}")
    }

    /// Runs in the forked child right before exec.
    pub fn apply_pre_exec(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            // Only ever lowers: an unprivileged child cannot raise its hard limit.
            fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
                let mut cur = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if unsafe { libc::getrlimit(resource, &mut cur) } == -1 {
                    return Err(io::Error::last_os_error());
                }
                let limit = (limit as libc::rlim_t).min(cur.rlim_max);
                let lim = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                let rc = unsafe { libc::setrlimit(resource, &lim) };
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            // If the supervisor dies, the bot goes with it.
            let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }

            set_rlimit(libc::RLIMIT_CORE, 0)?;

            if self.no_new_privs {
                let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
            }

            if self.nofile_limit > 0 {
                set_rlimit(libc::RLIMIT_NOFILE, self.nofile_limit)?;
            }
        }

        // Own session and process group, so signals reach the whole tree.
        #[cfg(unix)]
        {
            if unsafe { libc::setsid() } == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct SandboxLaunch {
    pub limits: SandboxLimits,
    cgroup_path: Option<PathBuf>,
    warnings: Vec<String>,
}

impl SandboxLaunch {
    pub fn summary(&self) -> String {
        let cgroup = if self.cgroup_path.is_some() { "on" } else { "off" };
        format!("{} cgroup={cgroup}", self.limits.summary())
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn attach_pid(&self, pid: u32) -> Option<String> {
        let path = self.cgroup_path.as_ref()?;
        let procs = path.join("cgroup.procs");
        if let Err(e) = std::fs::write(&procs, format!("{pid}\n")) {
            return Some(format!(
                "failed to attach pid {} to cgroup {}: {}",
                pid,
                path.display(),
                e
            ));
        }
        None
    }
}

fn sanitize_cgroup_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push_str("bot");
    }
    out
}

fn cgroup_path(bot_id: &BotId, cfg: &SandboxConfig) -> PathBuf {
    cfg.cgroup_root
        .join(format!("{}.{}", cfg.cgroup_prefix, sanitize_cgroup_name(&bot_id.0)))
}

#[cfg(target_os = "linux")]
fn try_prepare_cgroup(path: &Path, limits: &SandboxLimits) -> Result<(), String> {
    if let Err(e) = std::fs::create_dir(path)
        && e.kind() != io::ErrorKind::AlreadyExists
    {
        return Err(format!("create cgroup {}: {}", path.display(), e));
    }

    if limits.memory_bytes > 0
        && let Err(e) = std::fs::write(
            path.join("memory.max"),
            format!("{}\n", limits.memory_bytes),
        )
    {
        return Err(format!("configure memory.max in {}: {}", path.display(), e));
    }

    if limits.cpu_millicores > 0 {
        let period: u64 = 100_000;
        let quota = ((period as u128 * limits.cpu_millicores as u128) / 1000)
            .max(1000)
            .min(u64::MAX as u128) as u64;
        if let Err(e) = std::fs::write(path.join("cpu.max"), format!("{} {}\n", quota, period)) {
            return Err(format!("configure cpu.max in {}: {}", path.display(), e));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn try_prepare_cgroup(_path: &Path, _limits: &SandboxLimits) -> Result<(), String> {
    Err("cgroups are only supported on linux".to_string())
}

pub fn prepare(bot_id: &BotId, plan: &Plan, cfg: &SandboxConfig) -> SandboxLaunch {
    let limits = SandboxLimits::for_plan(plan, cfg);
    let mut warnings = Vec::new();
    let mut cgroup = None;
    if cfg.enable_cgroups {
        let path = cgroup_path(bot_id, cfg);
        match try_prepare_cgroup(&path, &limits) {
            Ok(()) => cgroup = Some(path),
            Err(e) => warnings.push(format!("cgroup limits unavailable: {e}")),
        }
    }
    SandboxLaunch {
        limits,
        cgroup_path: cgroup,
        warnings,
    }
}

/// Removes the bot's cgroup leaf, if one was created.
pub fn release(bot_id: &BotId, cfg: &SandboxConfig) {
    if !cfg.enable_cgroups {
        return;
    }
    let path = cgroup_path(bot_id, cfg);
    if let Err(e) = std::fs::remove_dir(&path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "cgroup not removed");
    }
}

/// Scrubbed environment for the child: a few host basics plus the credential.
pub fn child_env(credential_env: &str, credential: &Credential) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for key in PASSTHROUGH_ENV {
        if let Ok(v) = std::env::var(key) {
            out.insert((*key).to_string(), v);
        }
    }
    out.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    out.insert(credential_env.to_string(), credential.expose().to_string());
    out
}

#[cfg(test)]
mod tests {
    use botvisor_process::PlanTier;

    use super::*;

    #[test]
    fn limits_follow_plan() {
        let plan = PlanTier::Starter.default_plan();
        let l = SandboxLimits::for_plan(&plan, &SandboxConfig::default());
        assert_eq!(l.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(l.cpu_millicores, 800);
        assert_eq!(l.summary(), "mem=512MiB nofile=1024 cpu=800m");
    }

    #[test]
    fn cgroup_names_are_sanitized() {
        assert_eq!(sanitize_cgroup_name("a/b..c"), "a_b__c");
        assert_eq!(sanitize_cgroup_name(""), "bot");
    }

    #[test]
    fn child_env_carries_credential_only_under_its_name() {
        let cred = Credential::parse("123:abc").unwrap();
        let env = child_env("BOT_TOKEN", &cred);
        assert_eq!(env.get("BOT_TOKEN").map(String::as_str), Some("123:abc"));
        assert!(env.keys().all(|k| k == "BOT_TOKEN"
            || k == "PYTHONUNBUFFERED"
            || PASSTHROUGH_ENV.contains(&k.as_str())));
    }

    #[test]
    fn disabled_cgroups_produce_no_warnings() {
        let launch = prepare(
            &BotId::new(),
            &PlanTier::Free.default_plan(),
            &SandboxConfig::default(),
        );
        assert!(launch.warnings().is_empty());
        assert!(launch.summary().ends_with("cgroup=off"));
        assert_eq!(launch.attach_pid(1), None);
    }
}
