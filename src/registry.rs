use crate::error::RegistryError;
use crate::tasks::{EngineHandle, JobId, Stage, StatusRecord, TaskOutcome};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tracing::debug;

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, StatusRecord>,
    handles: HashMap<EngineHandle, JobId>,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changed: Arc::new(changed),
        }
    }

    pub fn put(&self, record: StatusRecord) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock();
            if inner.records.contains_key(&record.uid) {
                return Err(RegistryError::Duplicate(record.uid.to_string()));
            }
            if let Some(handle) = record.handle.clone() {
                inner.handles.insert(handle, record.uid.clone());
            }
            inner.records.insert(record.uid.clone(), record);
        }
        self.notify();
        Ok(())
    }

    pub fn get(&self, uid: &JobId) -> Option<StatusRecord> {
        self.inner.lock().records.get(uid).cloned()
    }

    pub fn find_by_handle(&self, handle: &EngineHandle) -> Option<StatusRecord> {
        let inner = self.inner.lock();
        let uid = inner.handles.get(handle)?;
        inner.records.get(uid).cloned()
    }

    /// Points the job at a new engine handle, dropping whatever handle it had.
    pub fn attach_handle(&self, uid: &JobId, handle: EngineHandle) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock();
            let Inner { records, handles } = &mut *inner;
            let record = records
                .get_mut(uid)
                .ok_or_else(|| RegistryError::NotFound(uid.to_string()))?;
            if let Some(previous) = record.handle.take() {
                handles.remove(&previous);
            }
            handles.insert(handle.clone(), uid.clone());
            record.handle = Some(handle);
        }
        self.notify();
        Ok(())
    }

    /// Attaches the handle an engine returned for a fresh job. Returns `false`
    /// when the job already moved on (a push engine finished before the add
    /// call returned) and the handle must not overwrite the current one.
    pub fn attach_download_handle(
        &self,
        uid: &JobId,
        handle: EngineHandle,
    ) -> Result<bool, RegistryError> {
        {
            let mut inner = self.inner.lock();
            let Inner { records, handles } = &mut *inner;
            let record = records
                .get_mut(uid)
                .ok_or_else(|| RegistryError::NotFound(uid.to_string()))?;
            if record.handle.is_some() || !record.stage.is_downloading() {
                return Ok(false);
            }
            handles.insert(handle.clone(), uid.clone());
            record.handle = Some(handle);
        }
        self.notify();
        Ok(true)
    }

    /// Replaces `old` by `new` in one critical section: a concurrent lookup sees
    /// either the old pair or the new pair, never a dangling handle.
    pub fn remap_handle(
        &self,
        uid: &JobId,
        old: &EngineHandle,
        new: EngineHandle,
    ) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock();
            let Inner { records, handles } = &mut *inner;
            let record = records
                .get_mut(uid)
                .ok_or_else(|| RegistryError::NotFound(uid.to_string()))?;
            if record.handle.as_ref() != Some(old) {
                return Err(RegistryError::StaleHandle {
                    uid: uid.to_string(),
                    handle: old.to_string(),
                });
            }
            handles.remove(old);
            handles.insert(new.clone(), uid.clone());
            record.handle = Some(new);
        }
        debug!(event = "handle_remapped", uid = %uid, old = %old);
        self.notify();
        Ok(())
    }

    pub fn update<R>(&self, uid: &JobId, f: impl FnOnce(&mut StatusRecord) -> R) -> Option<R> {
        let result = {
            let mut inner = self.inner.lock();
            inner.records.get_mut(uid).map(f)
        };
        if result.is_some() {
            self.notify();
        }
        result
    }

    /// Claims the terminal transition. Only the first caller gets the record
    /// back; later callers observe `None` and must do nothing.
    pub fn begin_terminal(&self, uid: &JobId, outcome: TaskOutcome) -> Option<StatusRecord> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(uid)?;
        if record.stage.is_terminal() {
            return None;
        }
        record.stage = Stage::Terminal(outcome);
        Some(record.clone())
    }

    pub fn remove(&self, uid: &JobId) -> Option<(StatusRecord, usize)> {
        let removed = {
            let mut inner = self.inner.lock();
            let record = inner.records.remove(uid)?;
            if let Some(handle) = record.handle.as_ref() {
                if inner.handles.get(handle) == Some(uid) {
                    inner.handles.remove(handle);
                }
            }
            let remaining = inner.records.len();
            (record, remaining)
        };
        self.notify();
        Some(removed)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn snapshot(&self) -> Vec<StatusRecord> {
        let mut records: Vec<StatusRecord> = self.inner.lock().records.values().cloned().collect();
        records.sort_by(|a, b| a.uid.cmp(&b.uid));
        records
    }

    /// Bumped on every mutation; the broadcaster re-renders when it moves.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    #[test]
    fn put_rejects_duplicates() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let err = registry.put(record("J1")).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("J1".into()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn attach_and_find_by_handle() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let uid = JobId::from_raw("J1");
        registry.attach_handle(&uid, EngineHandle::from_raw("G1")).unwrap();
        let found = registry.find_by_handle(&EngineHandle::from_raw("G1")).unwrap();
        assert_eq!(found.uid, uid);

        registry.attach_handle(&uid, EngineHandle::from_raw("U1")).unwrap();
        assert!(registry.find_by_handle(&EngineHandle::from_raw("G1")).is_none());
        assert!(registry.find_by_handle(&EngineHandle::from_raw("U1")).is_some());
    }

    #[test]
    fn download_handle_never_overwrites_upload_handle() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let uid = JobId::from_raw("J1");
        registry.update(&uid, |r| r.stage = Stage::Uploading);
        registry.attach_handle(&uid, EngineHandle::from_raw("U1")).unwrap();

        let attached = registry
            .attach_download_handle(&uid, EngineHandle::from_raw("G1"))
            .unwrap();
        assert!(!attached);
        assert_eq!(registry.get(&uid).unwrap().handle, Some(EngineHandle::from_raw("U1")));
        assert!(registry.find_by_handle(&EngineHandle::from_raw("G1")).is_none());

        registry.put(record("J2")).unwrap();
        assert!(registry
            .attach_download_handle(&JobId::from_raw("J2"), EngineHandle::from_raw("G2"))
            .unwrap());
    }

    #[test]
    fn remap_moves_reverse_index() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let uid = JobId::from_raw("J1");
        let old = EngineHandle::from_raw("gidA");
        let new = EngineHandle::from_raw("gidB");
        registry.attach_handle(&uid, old.clone()).unwrap();

        registry.remap_handle(&uid, &old, new.clone()).unwrap();
        assert!(registry.find_by_handle(&old).is_none());
        assert_eq!(registry.find_by_handle(&new).unwrap().uid, uid);
        assert_eq!(registry.get(&uid).unwrap().handle, Some(new.clone()));

        let err = registry
            .remap_handle(&uid, &old, EngineHandle::from_raw("gidC"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::StaleHandle { .. }));
        assert_eq!(registry.find_by_handle(&new).unwrap().uid, uid);
    }

    #[test]
    fn terminal_claim_is_exclusive() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        let uid = JobId::from_raw("J1");
        assert!(registry.begin_terminal(&uid, TaskOutcome::Success).is_some());
        assert!(registry.begin_terminal(&uid, TaskOutcome::Failed("late".into())).is_none());
        assert_eq!(
            registry.get(&uid).unwrap().stage,
            Stage::Terminal(TaskOutcome::Success)
        );
    }

    #[test]
    fn remove_reports_remaining_and_clears_handles() {
        let registry = Registry::new();
        registry.put(record("J1")).unwrap();
        registry.put(record("J2")).unwrap();
        let uid = JobId::from_raw("J1");
        registry.attach_handle(&uid, EngineHandle::from_raw("G1")).unwrap();

        let (removed, remaining) = registry.remove(&uid).unwrap();
        assert_eq!(removed.uid, uid);
        assert_eq!(remaining, 1);
        assert!(registry.get(&uid).is_none());
        assert!(registry.find_by_handle(&EngineHandle::from_raw("G1")).is_none());
        assert!(registry.remove(&uid).is_none());
    }

    #[tokio::test]
    async fn mutations_signal_subscribers() {
        let registry = Registry::new();
        let mut rx = registry.subscribe();
        registry.put(record("J1")).unwrap();
        rx.changed().await.unwrap();
        registry.update(&JobId::from_raw("J1"), |r| r.stage = Stage::Downloading);
        rx.changed().await.unwrap();
        assert!(registry.update(&JobId::from_raw("missing"), |_| ()).is_none());
    }

    #[test]
    fn concurrent_puts_keep_one_record_per_uid() {
        let registry = Registry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.put(record("J1")).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(registry.count(), 1);
    }
}
