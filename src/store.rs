use tokio::sync::watch;
use crate::types::{percent, TotalProgress, UploadId, UploadProgress, UploadStatus};

/// Observable table of upload records, the single source of truth for the
/// progress UI. Every mutation publishes a fresh copy of the full list, so
/// subscribers never observe a partially-applied change.
pub struct ProgressStore {
    tx: watch::Sender<Vec<UploadProgress>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Live list subscription consumed by the host UI.
    pub fn subscribe(&self) -> watch::Receiver<Vec<UploadProgress>> {
        self.tx.subscribe()
    }

    pub fn get(&self, upload_id: UploadId) -> Option<UploadProgress> {
        self.tx
            .borrow()
            .iter()
            .find(|p| p.upload_id == upload_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<UploadProgress> {
        self.tx.borrow().clone()
    }

    /// Replaces the record with a matching id or appends it, then publishes.
    pub fn upsert(&self, progress: UploadProgress) {
        self.tx.send_modify(|uploads| {
            match uploads.iter_mut().find(|p| p.upload_id == progress.upload_id) {
                Some(existing) => *existing = progress,
                None => uploads.push(progress),
            }
        });
    }

    /// Applies `f` to the record with the given id, if present, and publishes.
    /// Returns true when a record was found.
    pub fn update(&self, upload_id: UploadId, f: impl FnOnce(&mut UploadProgress)) -> bool {
        let mut found = false;
        self.tx.send_modify(|uploads| {
            if let Some(record) = uploads.iter_mut().find(|p| p.upload_id == upload_id) {
                f(record);
                found = true;
            }
        });
        found
    }

    pub fn remove(&self, upload_id: UploadId) {
        self.tx
            .send_modify(|uploads| uploads.retain(|p| p.upload_id != upload_id));
    }

    /// Aggregate over uploads currently uploading or paused. With none of
    /// those, reports 100% over zero totals so an empty panel does not look
    /// like stalled progress.
    pub fn total_progress(&self) -> TotalProgress {
        let uploads = self.tx.borrow();
        let active: Vec<_> = uploads
            .iter()
            .filter(|p| matches!(p.status, UploadStatus::Uploading | UploadStatus::Paused))
            .collect();

        if active.is_empty() {
            return TotalProgress {
                uploaded_bytes: 0,
                total_bytes: 0,
                progress: 100,
            };
        }

        let total_bytes: u64 = active.iter().map(|p| p.total_size).sum();
        let uploaded_bytes: u64 = active.iter().map(|p| p.uploaded_bytes).sum();
        TotalProgress {
            uploaded_bytes,
            total_bytes,
            progress: percent(uploaded_bytes, total_bytes),
        }
    }

    /// True when any upload is pending, uploading or paused.
    pub fn has_active(&self) -> bool {
        self.tx.borrow().iter().any(|p| {
            matches!(
                p.status,
                UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Paused
            )
        })
    }

    /// Drops completed, errored and cancelled entries from the list.
    pub fn clear_completed(&self) {
        self.tx.send_modify(|uploads| {
            uploads.retain(|p| {
                !matches!(
                    p.status,
                    UploadStatus::Completed | UploadStatus::Error | UploadStatus::Cancelled
                )
            })
        });
    }
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UploadProgress;

    fn record(status: UploadStatus, total: u64, uploaded: u64) -> UploadProgress {
        let mut p = UploadProgress::new(UploadId::new(), "file.bin", total);
        p.status = status;
        p.set_uploaded(uploaded);
        p
    }

    #[test]
    fn upsert_replaces_by_id_and_publishes() {
        let store = ProgressStore::new();
        let mut rx = store.subscribe();

        let mut p = record(UploadStatus::Uploading, 100, 10);
        store.upsert(p.clone());
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        p.set_uploaded(60);
        store.upsert(p.clone());
        let list = store.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].uploaded_bytes, 60);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn remove_deletes_and_publishes() {
        let store = ProgressStore::new();
        let p = record(UploadStatus::Uploading, 100, 0);
        let id = p.upload_id;
        store.upsert(p);
        store.remove(id);
        assert!(store.get(id).is_none());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn total_progress_over_zero_uploads_is_full() {
        let store = ProgressStore::new();
        assert_eq!(
            store.total_progress(),
            TotalProgress { uploaded_bytes: 0, total_bytes: 0, progress: 100 }
        );

        // Completed and errored uploads are excluded from the aggregate.
        store.upsert(record(UploadStatus::Completed, 100, 100));
        store.upsert(record(UploadStatus::Error, 100, 30));
        assert_eq!(store.total_progress().total_bytes, 0);
    }

    #[test]
    fn total_progress_aggregates_uploading_and_paused() {
        let store = ProgressStore::new();
        store.upsert(record(UploadStatus::Uploading, 100, 50));
        store.upsert(record(UploadStatus::Paused, 300, 150));
        store.upsert(record(UploadStatus::Completed, 1000, 1000));

        let total = store.total_progress();
        assert_eq!(total.total_bytes, 400);
        assert_eq!(total.uploaded_bytes, 200);
        assert_eq!(total.progress, 50);
    }

    #[test]
    fn clear_completed_keeps_live_uploads() {
        let store = ProgressStore::new();
        store.upsert(record(UploadStatus::Uploading, 10, 5));
        store.upsert(record(UploadStatus::Completed, 10, 10));
        store.upsert(record(UploadStatus::Error, 10, 2));
        store.upsert(record(UploadStatus::Cancelled, 10, 0));

        store.clear_completed();
        let list = store.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, UploadStatus::Uploading);
        assert!(store.has_active());
    }
}
