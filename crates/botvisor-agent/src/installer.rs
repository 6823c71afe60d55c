use std::{
    fs,
    io::{Cursor, Read},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use botvisor_process::{BotId, OwnerId, Plan};

use crate::{
    config::AgentConfig,
    error::{HostError, Result},
    quota,
    registry::{HostedBotRecord, Registry},
};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug)]
enum PathError {
    Absolute,
    Traversal,
}

fn normalize_rel_path(rel: &str) -> std::result::Result<PathBuf, PathError> {
    // Archives built on Windows may use backslashes as separators.
    let rel = rel.replace('\\', "/");
    let p = Path::new(&rel);
    if p.is_absolute() {
        return Err(PathError::Absolute);
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(PathError::Traversal),
            Component::Prefix(_) | Component::RootDir => return Err(PathError::Absolute),
        }
    }
    Ok(out)
}

/// Owner ids become directory names, so keep them filesystem safe.
pub(crate) fn owner_dir_name(owner: &OwnerId) -> Result<String> {
    let id = owner.0.trim();
    if id.is_empty()
        || id.len() > 128
        || id.starts_with('.')
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(HostError::InvalidOwnerId);
    }
    Ok(id.to_string())
}

fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06")
}

#[derive(Clone, Copy, Debug)]
struct ArchiveLimits {
    max_entries: usize,
    max_extracted_bytes: u64,
}

struct PlannedEntry {
    index: usize,
    rel: PathBuf,
    is_dir: bool,
}

/// Validates every entry name before anything touches the disk, so a hostile
/// archive is rejected wholesale.
fn scan_archive(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    limits: ArchiveLimits,
) -> Result<Vec<PlannedEntry>> {
    if archive.len() > limits.max_entries {
        return Err(HostError::InvalidArchive(format!(
            "too many entries ({} > {})",
            archive.len(),
            limits.max_entries
        )));
    }

    let mut planned = Vec::with_capacity(archive.len());
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let file = archive
            .by_index_raw(index)
            .map_err(|e| HostError::InvalidArchive(e.to_string()))?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches(['/', '\\']);
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed).map_err(|e| {
            tracing::debug!(entry = %name, error = ?e, "rejecting archive entry");
            HostError::PathTraversal(name.clone())
        })?;
        if file.enclosed_name().is_none() {
            return Err(HostError::PathTraversal(name));
        }
        if file.unix_mode().is_some_and(|m| m & S_IFMT == S_IFLNK) {
            return Err(HostError::PathTraversal(format!("{name} (symlink)")));
        }
        if rel.as_os_str().is_empty() {
            continue;
        }
        total = total.saturating_add(file.size());
        if total > limits.max_extracted_bytes {
            return Err(HostError::InvalidArchive(format!(
                "extracted size exceeds {} bytes",
                limits.max_extracted_bytes
            )));
        }
        planned.push(PlannedEntry {
            index,
            rel,
            is_dir: file.is_dir(),
        });
    }
    Ok(planned)
}

fn extract_archive(bytes: &[u8], out_dir: &Path, limits: ArchiveLimits) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| HostError::InvalidArchive(e.to_string()))?;
    let planned = scan_archive(&mut archive, limits)?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("create bundle dir {}", out_dir.display()))?;

    let mut budget = limits.max_extracted_bytes;
    for entry in planned {
        let out_path = out_dir.join(&entry.rel);
        if entry.is_dir {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("create {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = archive
            .by_index(entry.index)
            .map_err(|e| HostError::InvalidArchive(e.to_string()))?;
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create {}", out_path.display()))?;
        // Declared sizes can lie; cap what is actually inflated.
        let written = std::io::copy(&mut file.take(budget.saturating_add(1)), &mut out)
            .map_err(|e| HostError::InvalidArchive(format!("{}: {e}", entry.rel.display())))?;
        if written > budget {
            return Err(HostError::InvalidArchive(format!(
                "extracted size exceeds {} bytes",
                limits.max_extracted_bytes
            )));
        }
        budget -= written;
    }
    Ok(())
}

/// Finds the entry point at the bundle root, or inside a single wrapping folder.
fn locate_entry_point(dir: &Path, entry_point: &str) -> Option<PathBuf> {
    if dir.join(entry_point).is_file() {
        return Some(PathBuf::from(entry_point));
    }
    let entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n != "__MACOSX"))
        .collect();
    if let [only] = entries.as_slice()
        && only.is_dir()
        && only.join(entry_point).is_file()
    {
        let folder = only.file_name()?;
        return Some(PathBuf::from(folder).join(entry_point));
    }
    None
}

/// Next `bot_<n>` name: one past the highest ordinal still in use.
fn next_bot_name(existing: &[HostedBotRecord]) -> String {
    let highest = existing
        .iter()
        .filter(|r| !r.state().is_terminal())
        .filter_map(|r| r.name.strip_prefix("bot_")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("bot_{}", highest.saturating_add(1))
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), %err, "failed to clean up bundle dir");
    }
}

/// Turns uploaded bundles into `awaiting_credential` records.
#[derive(Clone, Debug)]
pub struct Installer {
    config: Arc<AgentConfig>,
    registry: Registry,
}

impl Installer {
    pub fn new(config: Arc<AgentConfig>, registry: Registry) -> Self {
        Self { config, registry }
    }

    pub async fn install(
        &self,
        owner_id: &OwnerId,
        plan: &Plan,
        archive_bytes: Vec<u8>,
    ) -> Result<HostedBotRecord> {
        let owner_dir = owner_dir_name(owner_id)?;

        let existing = self.registry.list_by_owner(owner_id).await;
        if !quota::can_deploy(owner_id, plan, &existing) {
            return Err(HostError::QuotaExceeded {
                max_bots: plan.max_bots,
            });
        }

        let size = archive_bytes.len() as u64;
        if size > self.config.max_archive_bytes {
            return Err(HostError::InvalidArchive(format!(
                "archive is {size} bytes, limit is {}",
                self.config.max_archive_bytes
            )));
        }
        if !looks_like_zip(&archive_bytes) {
            return Err(HostError::InvalidArchive("not a zip archive".to_string()));
        }

        let id = BotId::new();
        let dir = self.config.bots_dir().join(owner_dir).join(&id.0);
        let limits = ArchiveLimits {
            max_entries: self.config.max_archive_entries,
            max_extracted_bytes: self.config.max_extracted_bytes,
        };

        let extracted = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || extract_archive(&archive_bytes, &dir, limits)
        })
        .await
        .context("extract task failed")
        .map_err(HostError::from)
        .and_then(|r| r);
        if let Err(err) = extracted {
            remove_dir_quietly(&dir).await;
            tracing::info!(owner_id = %owner_id, code = err.code(), "rejected bundle");
            return Err(err);
        }

        let Some(entry_point) = locate_entry_point(&dir, &self.config.entry_point) else {
            remove_dir_quietly(&dir).await;
            return Err(HostError::MissingEntryPoint(self.config.entry_point.clone()));
        };

        let record = HostedBotRecord::new(
            id.clone(),
            owner_id.clone(),
            next_bot_name(&existing),
            plan.tier,
            dir.clone(),
            entry_point,
        );

        // Re-check under the registry lock: a concurrent install may have taken the slot.
        let created = self
            .registry
            .create(record.clone(), |others| {
                quota::can_deploy(owner_id, plan, others)
            })
            .await;
        if !created {
            remove_dir_quietly(&dir).await;
            return Err(HostError::QuotaExceeded {
                max_bots: plan.max_bots,
            });
        }

        tracing::info!(bot_id = %id, owner_id = %owner_id, dir = %dir.display(), "bundle installed");
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use botvisor_process::{BotState, PlanTier};
    use zip::write::SimpleFileOptions;

    use super::*;

    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                w.add_directory(*name, SimpleFileOptions::default()).unwrap();
                continue;
            }
            w.start_file(*name, SimpleFileOptions::default()).unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    fn installer(root: &Path) -> Installer {
        let cfg = AgentConfig {
            data_root: root.to_path_buf(),
            ..AgentConfig::default()
        };
        Installer::new(Arc::new(cfg), Registry::in_memory())
    }

    fn free() -> Plan {
        PlanTier::Free.default_plan()
    }

    fn owner_dir_is_empty(root: &Path, owner: &str) -> bool {
        let dir = root.join("bots").join(owner);
        match fs::read_dir(&dir) {
            Ok(rd) => rd.count() == 0,
            Err(_) => true,
        }
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert!(matches!(normalize_rel_path("../x"), Err(PathError::Traversal)));
        assert!(matches!(normalize_rel_path("a/../../x"), Err(PathError::Traversal)));
        assert!(matches!(normalize_rel_path("..\\x"), Err(PathError::Traversal)));
        assert!(matches!(normalize_rel_path("/etc/passwd"), Err(PathError::Absolute)));
        assert_eq!(normalize_rel_path("./a/b.py").unwrap(), PathBuf::from("a/b.py"));
    }

    #[test]
    fn owner_ids_must_be_path_safe() {
        assert!(owner_dir_name(&OwnerId::from("7089004530")).is_ok());
        for bad in ["", "..", "a/b", ".hidden", "a b"] {
            assert!(owner_dir_name(&OwnerId::from(bad)).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn install_creates_awaiting_credential_record() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let owner = OwnerId::from("42");
        let bytes = zip_bytes(&[
            ("main.py", b"print('hi')\n"),
            ("lib/", b""),
            ("lib/util.py", b"X = 1\n"),
        ]);

        let rec = inst.install(&owner, &free(), bytes).await.unwrap();
        assert_eq!(rec.state(), BotState::AwaitingCredential);
        assert_eq!(rec.name, "bot_1");
        assert_eq!(rec.entry_point, PathBuf::from("main.py"));
        assert!(rec.working_dir.join("main.py").is_file());
        assert!(rec.working_dir.join("lib/util.py").is_file());
        assert!(rec.working_dir.starts_with(tmp.path().join("bots").join("42")));
        assert!(rec.credential.is_none());
    }

    #[tokio::test]
    async fn entry_point_inside_single_folder_is_found() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let bytes = zip_bytes(&[("mybot/", b""), ("mybot/main.py", b"pass\n")]);
        let rec = inst
            .install(&OwnerId::from("42"), &free(), bytes)
            .await
            .unwrap();
        assert_eq!(rec.entry_point, PathBuf::from("mybot/main.py"));
    }

    #[tokio::test]
    async fn names_skip_past_the_highest_live_ordinal() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let owner = OwnerId::from("42");
        let plan = PlanTier::Pro.default_plan();
        let bytes = zip_bytes(&[("main.py", b"pass\n")]);

        let first = inst.install(&owner, &plan, bytes.clone()).await.unwrap();
        let second = inst.install(&owner, &plan, bytes.clone()).await.unwrap();
        assert_eq!((first.name.as_str(), second.name.as_str()), ("bot_1", "bot_2"));

        assert!(
            inst.registry
                .compare_and_set_state(&first.id, BotState::AwaitingCredential, BotState::Deleted)
                .await
        );
        let third = inst.install(&owner, &plan, bytes).await.unwrap();
        assert_eq!(third.name, "bot_3");
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_residue() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let bytes = zip_bytes(&[("main.py", b"pass\n"), ("../evil.py", b"boom\n")]);

        let err = inst
            .install(&OwnerId::from("42"), &free(), bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::PathTraversal(_)), "{err}");
        assert!(owner_dir_is_empty(tmp.path(), "42"));
        assert!(!tmp.path().join("bots").join("evil.py").exists());
        assert!(inst.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn missing_entry_point_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let bytes = zip_bytes(&[("bot.py", b"pass\n")]);

        let err = inst
            .install(&OwnerId::from("42"), &free(), bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::MissingEntryPoint(_)));
        assert!(owner_dir_is_empty(tmp.path(), "42"));
        assert!(inst.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn non_zip_and_oversized_inputs_are_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            data_root: tmp.path().to_path_buf(),
            max_archive_bytes: 64,
            ..AgentConfig::default()
        };
        let inst = Installer::new(Arc::new(cfg), Registry::in_memory());
        let owner = OwnerId::from("42");

        let err = inst
            .install(&owner, &free(), b"definitely not a zip".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidArchive(_)));

        let big = zip_bytes(&[("main.py", &[b'#'; 4096])]);
        let err = inst.install(&owner, &free(), big).await.unwrap_err();
        assert!(matches!(err, HostError::InvalidArchive(_)));
        assert!(owner_dir_is_empty(tmp.path(), "42"));
    }

    #[tokio::test]
    async fn extracted_size_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            data_root: tmp.path().to_path_buf(),
            max_extracted_bytes: 1024,
            ..AgentConfig::default()
        };
        let inst = Installer::new(Arc::new(cfg), Registry::in_memory());
        let bytes = zip_bytes(&[("main.py", b"pass\n"), ("blob.bin", &[0u8; 8192])]);
        let err = inst
            .install(&OwnerId::from("42"), &free(), bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidArchive(_)));
        assert!(owner_dir_is_empty(tmp.path(), "42"));
    }

    #[tokio::test]
    async fn quota_is_checked_before_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = installer(tmp.path());
        let owner = OwnerId::from("42");
        let bytes = zip_bytes(&[("main.py", b"pass\n")]);

        inst.install(&owner, &free(), bytes.clone()).await.unwrap();
        let err = inst.install(&owner, &free(), bytes).await.unwrap_err();
        assert!(matches!(err, HostError::QuotaExceeded { max_bots: 1 }));
        assert_eq!(inst.registry.list_by_owner(&owner).await.len(), 1);
    }
}
