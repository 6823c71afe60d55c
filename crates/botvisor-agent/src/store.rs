use std::path::PathBuf;

use anyhow::Context;
use botvisor_process::BotId;
use tokio::io::AsyncWriteExt;

use crate::registry::HostedBotRecord;

/// Durable mirror of the registry: one JSON document per record.
#[derive(Clone, Debug)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &BotId) -> PathBuf {
        self.dir.join(format!("{}.json", id.0))
    }

    pub async fn save(&self, record: &HostedBotRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create records dir")?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).context("serialize record")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data).await.context("write record")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("persist {}", path.display()))?;
        Ok(())
    }

    pub async fn remove(&self, id: &BotId) -> anyhow::Result<()> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    pub async fn load_all(&self) -> anyhow::Result<Vec<HostedBotRecord>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).context("read records dir"),
        };
        while let Some(entry) = rd.next_entry().await.context("read records dir")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_slice::<HostedBotRecord>(&raw) {
                Ok(r) => out.push(r),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping corrupt record");
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}
