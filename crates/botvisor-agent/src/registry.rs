use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

use botvisor_process::{BotId, BotState, Credential, ExitInfo, ExitReason, OwnerId, PlanTier};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::RecordStore;

/// One deployed bundle.
///
/// `state` is private: the only way to change it is through the registry's
/// compare-and-set primitives.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HostedBotRecord {
    pub id: BotId,
    pub owner_id: OwnerId,
    pub name: String,
    pub plan_tier: PlanTier,
    pub working_dir: PathBuf,
    /// Relative to `working_dir`.
    pub entry_point: PathBuf,
    #[serde(default)]
    pub credential: Option<Credential>,
    state: BotState,
    /// Mirror of the supervisor's live handle; never persisted.
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_exit: Option<ExitInfo>,
    /// Human readable status for the outward-facing layer.
    #[serde(default)]
    pub message: Option<String>,
}

impl HostedBotRecord {
    pub fn new(
        id: BotId,
        owner_id: OwnerId,
        name: String,
        plan_tier: PlanTier,
        working_dir: PathBuf,
        entry_point: PathBuf,
    ) -> Self {
        Self {
            id,
            owner_id,
            name,
            plan_tier,
            working_dir,
            entry_point,
            credential: None,
            state: BotState::AwaitingCredential,
            pid: None,
            restart_count: 0,
            last_started_at: None,
            created_at: Utc::now(),
            last_exit: None,
            message: None,
        }
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    /// Directory holding the entry point; the child runs from here so that
    /// relative paths in bot code resolve next to its own files.
    pub fn launch_dir(&self) -> PathBuf {
        match self.entry_point.parent() {
            Some(p) if !p.as_os_str().is_empty() => self.working_dir.join(p),
            _ => self.working_dir.clone(),
        }
    }

    /// Entry point relative to [`launch_dir`](Self::launch_dir).
    pub fn entry_file(&self) -> PathBuf {
        self.entry_point
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.entry_point.clone())
    }
}

/// Result of a guarded state transition.
#[derive(Debug)]
pub enum Transition {
    Applied(HostedBotRecord),
    /// The record was missing (`None`) or not in the expected state.
    Mismatch(Option<BotState>),
    /// The admission guard refused the transition.
    Denied,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<BotId, HostedBotRecord>,
    by_owner: HashMap<OwnerId, BTreeSet<BotId>>,
}

impl Tables {
    fn owner_records(&self, owner: &OwnerId) -> Vec<HostedBotRecord> {
        self.by_owner
            .get(owner)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert(&mut self, record: HostedBotRecord) {
        self.by_owner
            .entry(record.owner_id.clone())
            .or_default()
            .insert(record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &BotId) -> Option<HostedBotRecord> {
        let record = self.records.remove(id)?;
        if let Some(ids) = self.by_owner.get_mut(&record.owner_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_owner.remove(&record.owner_id);
            }
        }
        Some(record)
    }
}

/// Authoritative bot table, keyed by id with a secondary owner index.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    inner: Arc<Mutex<Tables>>,
    store: Option<RecordStore>,
}

impl Registry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads persisted records and reconciles states that imply a live process,
    /// since no process handle survives a supervisor restart.
    pub async fn open(store: RecordStore) -> anyhow::Result<Self> {
        let mut tables = Tables::default();
        let mut reconciled = Vec::new();
        for mut record in store.load_all().await? {
            match record.state {
                BotState::Starting | BotState::Running => {
                    record.state = BotState::Crashed;
                    record.last_exit = Some(ExitInfo {
                        reason: ExitReason::UnexpectedCrash,
                        exit_code: None,
                        at: Utc::now(),
                    });
                    record.message = Some("supervisor restarted".to_string());
                    reconciled.push(record.clone());
                }
                BotState::Stopping => {
                    record.state = BotState::Stopped;
                    record.message = Some("stopped".to_string());
                    reconciled.push(record.clone());
                }
                _ => {}
            }
            tables.insert(record);
        }

        for record in &reconciled {
            tracing::info!(bot_id = %record.id, state = %record.state, "reconciled bot after restart");
            store.save(record).await?;
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(tables)),
            store: Some(store),
        })
    }

    async fn persist(&self, record: &HostedBotRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(record).await {
            tracing::warn!(bot_id = %record.id, error = %crate::error::format_error_chain(&err), "failed to persist record");
        }
    }

    pub async fn get(&self, id: &BotId) -> Option<HostedBotRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<HostedBotRecord> {
        let tables = self.inner.lock().await;
        let mut out: Vec<_> = tables.records.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Vec<HostedBotRecord> {
        let mut out = self.inner.lock().await.owner_records(owner);
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Inserts a new record if `admit` accepts the owner's current records.
    /// The check and the insert happen under one lock.
    pub async fn create(
        &self,
        record: HostedBotRecord,
        admit: impl FnOnce(&[HostedBotRecord]) -> bool,
    ) -> bool {
        let mut tables = self.inner.lock().await;
        if tables.records.contains_key(&record.id) {
            return false;
        }
        if !admit(&tables.owner_records(&record.owner_id)) {
            return false;
        }
        tables.insert(record.clone());
        self.persist(&record).await;
        true
    }

    /// The single state mutation primitive. Applies `expected -> next` only if
    /// the record is currently in `expected`, the lifecycle table allows it and
    /// `admit` accepts the owner's other records. `mutate` may adjust the
    /// non-state fields as part of the same step.
    pub async fn transition(
        &self,
        id: &BotId,
        expected: BotState,
        next: BotState,
        admit: impl FnOnce(&[HostedBotRecord]) -> bool,
        mutate: impl FnOnce(&mut HostedBotRecord),
    ) -> Transition {
        let mut tables = self.inner.lock().await;
        let current = tables.records.get(id).map(|r| r.state);
        if current != Some(expected) {
            return Transition::Mismatch(current);
        }
        if !expected.can_transition_to(next) {
            tracing::warn!(bot_id = %id, from = %expected, to = %next, "rejected illegal transition");
            return Transition::Mismatch(current);
        }

        let Some(owner) = tables.records.get(id).map(|r| r.owner_id.clone()) else {
            return Transition::Mismatch(None);
        };
        let others: Vec<HostedBotRecord> = tables
            .owner_records(&owner)
            .into_iter()
            .filter(|r| &r.id != id)
            .collect();
        if !admit(&others) {
            return Transition::Denied;
        }

        let Some(record) = tables.records.get_mut(id) else {
            return Transition::Mismatch(None);
        };
        mutate(record);
        record.state = next;
        let snapshot = record.clone();
        tracing::debug!(bot_id = %id, from = %expected, to = %next, "state transition");
        self.persist(&snapshot).await;
        Transition::Applied(snapshot)
    }

    pub async fn compare_and_set(
        &self,
        id: &BotId,
        expected: BotState,
        next: BotState,
        mutate: impl FnOnce(&mut HostedBotRecord),
    ) -> bool {
        self.transition(id, expected, next, |_| true, mutate)
            .await
            .applied()
    }

    pub async fn compare_and_set_state(&self, id: &BotId, expected: BotState, next: BotState) -> bool {
        self.compare_and_set(id, expected, next, |_| {}).await
    }

    /// Forgets a record entirely, on disk too, if it is still in `expected`.
    /// Only for undoing an install that never got past `awaiting_credential`;
    /// everything else goes through `deleted`.
    pub async fn remove(&self, id: &BotId, expected: BotState) -> Option<HostedBotRecord> {
        let mut tables = self.inner.lock().await;
        if tables.records.get(id).map(|r| r.state) != Some(expected) {
            return None;
        }
        let record = tables.remove(id)?;
        if let Some(store) = &self.store
            && let Err(err) = store.remove(id).await
        {
            tracing::warn!(bot_id = %id, error = %crate::error::format_error_chain(&err), "failed to remove record file");
        }
        tracing::debug!(bot_id = %id, "record removed");
        Some(record)
    }

    /// Updates non-state fields. Returns false if the record does not exist.
    pub async fn update(&self, id: &BotId, f: impl FnOnce(&mut HostedBotRecord)) -> bool {
        let mut tables = self.inner.lock().await;
        let Some(record) = tables.records.get_mut(id) else {
            return false;
        };
        f(record);
        let snapshot = record.clone();
        self.persist(&snapshot).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str) -> HostedBotRecord {
        let id = BotId::new();
        HostedBotRecord::new(
            id.clone(),
            OwnerId::from(owner),
            "bot_1".to_string(),
            PlanTier::Free,
            PathBuf::from("/tmp").join(&id.0),
            PathBuf::from("main.py"),
        )
    }

    #[test]
    fn wrapped_entry_point_runs_from_its_folder() {
        let mut r = record("alice");
        assert_eq!(r.launch_dir(), r.working_dir);
        assert_eq!(r.entry_file(), PathBuf::from("main.py"));

        r.entry_point = PathBuf::from("mybot/main.py");
        assert_eq!(r.launch_dir(), r.working_dir.join("mybot"));
        assert_eq!(r.entry_file(), PathBuf::from("main.py"));
    }

    #[tokio::test]
    async fn create_indexes_by_owner() {
        let reg = Registry::in_memory();
        let a = record("alice");
        let b = record("bob");
        assert!(reg.create(a.clone(), |_| true).await);
        assert!(reg.create(b.clone(), |_| true).await);

        let alice = reg.list_by_owner(&OwnerId::from("alice")).await;
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, a.id);
        assert_eq!(alice[0].state(), BotState::AwaitingCredential);
        assert_eq!(reg.list().await.len(), 2);
    }

    #[tokio::test]
    async fn create_respects_admission() {
        let reg = Registry::in_memory();
        assert!(reg.create(record("alice"), |others| others.is_empty()).await);
        assert!(!reg.create(record("alice"), |others| others.is_empty()).await);
        assert_eq!(reg.list_by_owner(&OwnerId::from("alice")).await.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_only_from_expected_state() {
        let reg = Registry::in_memory();
        let r = record("alice");
        reg.create(r.clone(), |_| true).await;

        assert!(!reg.compare_and_set_state(&r.id, BotState::Ready, BotState::Starting).await);
        assert!(
            reg.compare_and_set_state(&r.id, BotState::AwaitingCredential, BotState::Ready)
                .await
        );
        // Second identical CAS loses: the state already moved on.
        assert!(
            !reg.compare_and_set_state(&r.id, BotState::AwaitingCredential, BotState::Ready)
                .await
        );
        assert_eq!(reg.get(&r.id).await.unwrap().state(), BotState::Ready);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let reg = Registry::in_memory();
        let r = record("alice");
        reg.create(r.clone(), |_| true).await;
        assert!(
            !reg.compare_and_set_state(&r.id, BotState::AwaitingCredential, BotState::Starting)
                .await
        );
        assert_eq!(
            reg.get(&r.id).await.unwrap().state(),
            BotState::AwaitingCredential
        );
    }

    #[tokio::test]
    async fn racing_transitions_have_one_winner() {
        let reg = Registry::in_memory();
        let r = record("alice");
        reg.create(r.clone(), |_| true).await;
        reg.compare_and_set_state(&r.id, BotState::AwaitingCredential, BotState::Ready)
            .await;
        reg.compare_and_set_state(&r.id, BotState::Ready, BotState::Starting)
            .await;
        reg.compare_and_set_state(&r.id, BotState::Starting, BotState::Running)
            .await;

        let mut tasks = Vec::new();
        for next in [BotState::Stopping, BotState::Crashed, BotState::Stopping] {
            let reg = reg.clone();
            let id = r.id.clone();
            tasks.push(tokio::spawn(async move {
                reg.compare_and_set_state(&id, BotState::Running, next).await
            }));
        }
        let mut wins = 0;
        for t in tasks {
            if t.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn guarded_transition_can_be_denied() {
        let reg = Registry::in_memory();
        let r = record("alice");
        reg.create(r.clone(), |_| true).await;
        let t = reg
            .transition(
                &r.id,
                BotState::AwaitingCredential,
                BotState::Ready,
                |_| false,
                |_| {},
            )
            .await;
        assert!(matches!(t, Transition::Denied));
        assert_eq!(
            reg.get(&r.id).await.unwrap().state(),
            BotState::AwaitingCredential
        );
    }

    #[tokio::test]
    async fn remove_only_from_expected_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::new(tmp.path().join("records"));
        let reg = Registry::open(store.clone()).await.unwrap();
        let keep = record("alice");
        let gone = record("alice");
        reg.create(keep.clone(), |_| true).await;
        reg.create(gone.clone(), |_| true).await;
        reg.compare_and_set_state(&keep.id, BotState::AwaitingCredential, BotState::Ready)
            .await;

        assert!(reg.remove(&keep.id, BotState::AwaitingCredential).await.is_none());
        assert!(reg.remove(&gone.id, BotState::AwaitingCredential).await.is_some());
        assert!(reg.get(&gone.id).await.is_none());
        let left = reg.list_by_owner(&OwnerId::from("alice")).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, keep.id);

        let reopened = Registry::open(store).await.unwrap();
        assert!(reopened.get(&gone.id).await.is_none());
        assert!(reopened.get(&keep.id).await.is_some());
    }

    #[tokio::test]
    async fn open_reconciles_live_states() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::new(tmp.path().join("records"));
        let reg = Registry::open(store.clone()).await.unwrap();

        let running = record("alice");
        let stopping = record("alice");
        let ready = record("bob");
        for r in [&running, &stopping, &ready] {
            reg.create(r.clone(), |_| true).await;
            reg.compare_and_set_state(&r.id, BotState::AwaitingCredential, BotState::Ready)
                .await;
        }
        for r in [&running, &stopping] {
            reg.compare_and_set_state(&r.id, BotState::Ready, BotState::Starting)
                .await;
            reg.compare_and_set(&r.id, BotState::Starting, BotState::Running, |rec| {
                rec.pid = Some(4242);
            })
            .await;
        }
        reg.compare_and_set_state(&stopping.id, BotState::Running, BotState::Stopping)
            .await;

        let reopened = Registry::open(store).await.unwrap();
        let r = reopened.get(&running.id).await.unwrap();
        assert_eq!(r.state(), BotState::Crashed);
        assert_eq!(r.pid, None);
        assert_eq!(
            r.last_exit.as_ref().map(|e| e.reason),
            Some(ExitReason::UnexpectedCrash)
        );
        assert_eq!(
            reopened.get(&stopping.id).await.unwrap().state(),
            BotState::Stopped
        );
        assert_eq!(reopened.get(&ready.id).await.unwrap().state(), BotState::Ready);
    }
}
