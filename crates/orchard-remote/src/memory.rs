//! In-memory remote store honoring the full adapter contract.
//!
//! Versioning tokens are monotonic (`e1`, `e2`, … / `r1`, `r2`, …) and every
//! conditional operation checks its `if_match` against the node's current
//! ETag, so conflict-protocol behavior can be exercised deterministically.
//! Tests can flip the store offline, mutate ETags out from under the engine,
//! and count network calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use orchard_core::domain::{CloudId, Etag, ObjectKind, Revision};
use orchard_core::ports::remote::{
    MutationReceipt, RemoteAdapter, RemoteChild, RemoteError, RemoteMetadata, UploadResult,
};

struct Node {
    parent: Option<String>,
    name: String,
    kind: ObjectKind,
    content: Vec<u8>,
    etag: String,
    revision: String,
    modified_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    offline: bool,
    auth_failed: bool,
}

/// Counters for asserting on network traffic in tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub list: u64,
    pub metadata: u64,
    pub download: u64,
    pub upload: u64,
    pub rename: u64,
    pub move_to: u64,
    pub delete: u64,
}

/// In-memory [`RemoteAdapter`].
pub struct MemoryRemote {
    state: Mutex<State>,
    counts: Mutex<CallCounts>,
    next_id: AtomicU64,
    next_token: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            counts: Mutex::new(CallCounts::default()),
            next_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> String {
        format!("cloud-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn fresh_tokens(&self) -> (String, String) {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        (format!("e{}", n), format!("r{}", n))
    }

    // ========================================================================
    // Seeding and fault injection
    // ========================================================================

    /// Create the remote root folder.
    pub fn seed_root(&self) -> CloudId {
        let id = self.fresh_id();
        let (etag, revision) = self.fresh_tokens();
        self.state.lock().unwrap().nodes.insert(
            id.clone(),
            Node {
                parent: None,
                name: String::new(),
                kind: ObjectKind::Folder,
                content: Vec::new(),
                etag,
                revision,
                modified_at: Utc::now(),
            },
        );
        CloudId::new(id).unwrap()
    }

    /// Seed a folder under `parent`.
    pub fn seed_folder(&self, parent: &CloudId, name: &str) -> CloudId {
        let id = self.fresh_id();
        let (etag, revision) = self.fresh_tokens();
        self.state.lock().unwrap().nodes.insert(
            id.clone(),
            Node {
                parent: Some(parent.as_str().to_string()),
                name: name.to_string(),
                kind: ObjectKind::Folder,
                content: Vec::new(),
                etag,
                revision,
                modified_at: Utc::now(),
            },
        );
        CloudId::new(id).unwrap()
    }

    /// Seed a file with content under `parent`.
    pub fn seed_file(&self, parent: &CloudId, name: &str, content: &[u8]) -> CloudId {
        let id = self.fresh_id();
        let (etag, revision) = self.fresh_tokens();
        self.state.lock().unwrap().nodes.insert(
            id.clone(),
            Node {
                parent: Some(parent.as_str().to_string()),
                name: name.to_string(),
                kind: ObjectKind::File,
                content: content.to_vec(),
                etag,
                revision,
                modified_at: Utc::now(),
            },
        );
        CloudId::new(id).unwrap()
    }

    /// Overwrite a node's content out-of-band, bumping its tokens — the
    /// "remote changed behind our back" scenario.
    pub fn mutate_content(&self, cloud_id: &CloudId, content: &[u8]) -> Etag {
        let (etag, revision) = self.fresh_tokens();
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(cloud_id.as_str())
            .expect("mutate_content on unknown node");
        node.content = content.to_vec();
        node.etag = etag.clone();
        node.revision = revision;
        node.modified_at = Utc::now();
        Etag::new(etag).unwrap()
    }

    /// Remove a node out-of-band — the "remote deleted it" scenario.
    pub fn delete_out_of_band(&self, cloud_id: &CloudId) {
        self.state.lock().unwrap().nodes.remove(cloud_id.as_str());
    }

    /// Simulate a network partition: every call fails transiently.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Simulate expired credentials: every call fails with `Auth`.
    pub fn set_auth_failed(&self, failed: bool) {
        self.state.lock().unwrap().auth_failed = failed;
    }

    /// Current content of a node, for round-trip assertions.
    pub fn content_of(&self, cloud_id: &CloudId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(cloud_id.as_str())
            .map(|n| n.content.clone())
    }

    /// Whether a node exists.
    pub fn node_exists(&self, cloud_id: &CloudId) -> bool {
        self.state.lock().unwrap().nodes.contains_key(cloud_id.as_str())
    }

    /// Find a child's cloud id by name.
    pub fn find_child(&self, parent: &CloudId, name: &str) -> Option<CloudId> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|(_, n)| n.parent.as_deref() == Some(parent.as_str()) && n.name == name)
            .map(|(id, _)| CloudId::new(id.clone()).unwrap())
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> CallCounts {
        self.counts.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        if state.auth_failed {
            return Err(RemoteError::Auth("token expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteAdapter for MemoryRemote {
    async fn list(&self, folder_cloud_id: &CloudId) -> Result<Vec<RemoteChild>, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().list += 1;
        let state = self.state.lock().unwrap();
        if !state.nodes.contains_key(folder_cloud_id.as_str()) {
            return Err(RemoteError::NotFound);
        }
        let mut children: Vec<RemoteChild> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.as_deref() == Some(folder_cloud_id.as_str()))
            .map(|(id, n)| RemoteChild {
                cloud_id: CloudId::new(id.clone()).unwrap(),
                name: n.name.clone(),
                kind: n.kind,
                size: n.content.len() as u64,
                etag: Etag::new(n.etag.clone()).unwrap(),
                modified_at: n.modified_at,
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn metadata(&self, cloud_id: &CloudId) -> Result<RemoteMetadata, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().metadata += 1;
        let state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(cloud_id.as_str())
            .ok_or(RemoteError::NotFound)?;
        Ok(RemoteMetadata {
            etag: Etag::new(node.etag.clone()).unwrap(),
            revision: Revision::new(node.revision.clone()).unwrap(),
            modified_at: node.modified_at,
            size: node.content.len() as u64,
        })
    }

    async fn download_range(
        &self,
        cloud_id: &CloudId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().download += 1;
        let state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(cloud_id.as_str())
            .ok_or(RemoteError::NotFound)?;
        let len = node.content.len() as u64;
        if len == 0 && start == 0 {
            return Ok(Vec::new());
        }
        if start >= len {
            return Err(RemoteError::Other(format!(
                "range start {} beyond size {}",
                start, len
            )));
        }
        let end = end.min(len - 1);
        Ok(node.content[start as usize..=end as usize].to_vec())
    }

    async fn upload(
        &self,
        parent_cloud_id: &CloudId,
        name: &str,
        content: Vec<u8>,
        if_match: Option<&Etag>,
    ) -> Result<UploadResult, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().upload += 1;
        let (etag, revision) = self.fresh_tokens();
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(parent_cloud_id.as_str()) {
            return Err(RemoteError::NotFound);
        }

        let existing = state
            .nodes
            .iter()
            .find(|(_, n)| {
                n.parent.as_deref() == Some(parent_cloud_id.as_str()) && n.name == name
            })
            .map(|(id, n)| (id.clone(), n.etag.clone()));

        match existing {
            Some((id, current_etag)) => {
                if let Some(expected) = if_match {
                    if expected.as_str() != current_etag {
                        return Err(RemoteError::PreconditionFailed);
                    }
                } else {
                    // Unconditional upload onto an existing name replaces it.
                }
                let node = state.nodes.get_mut(&id).expect("existing node");
                node.content = content;
                node.etag = etag.clone();
                node.revision = revision.clone();
                node.modified_at = Utc::now();
                Ok(UploadResult {
                    cloud_id: CloudId::new(id).unwrap(),
                    etag: Etag::new(etag).unwrap(),
                    revision: Revision::new(revision).unwrap(),
                })
            }
            None => {
                if if_match.is_some() {
                    // Conditional update of a name that no longer exists.
                    return Err(RemoteError::NotFound);
                }
                let id = self.fresh_id();
                state.nodes.insert(
                    id.clone(),
                    Node {
                        parent: Some(parent_cloud_id.as_str().to_string()),
                        name: name.to_string(),
                        kind: ObjectKind::File,
                        content,
                        etag: etag.clone(),
                        revision: revision.clone(),
                        modified_at: Utc::now(),
                    },
                );
                Ok(UploadResult {
                    cloud_id: CloudId::new(id).unwrap(),
                    etag: Etag::new(etag).unwrap(),
                    revision: Revision::new(revision).unwrap(),
                })
            }
        }
    }

    async fn create_folder(
        &self,
        parent_cloud_id: &CloudId,
        name: &str,
    ) -> Result<UploadResult, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().upload += 1;
        let (etag, revision) = self.fresh_tokens();
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(parent_cloud_id.as_str()) {
            return Err(RemoteError::NotFound);
        }
        // Folder creation is idempotent on name.
        if let Some((id, n)) = state
            .nodes
            .iter()
            .find(|(_, n)| n.parent.as_deref() == Some(parent_cloud_id.as_str()) && n.name == name)
        {
            return Ok(UploadResult {
                cloud_id: CloudId::new(id.clone()).unwrap(),
                etag: Etag::new(n.etag.clone()).unwrap(),
                revision: Revision::new(n.revision.clone()).unwrap(),
            });
        }
        let id = self.fresh_id();
        state.nodes.insert(
            id.clone(),
            Node {
                parent: Some(parent_cloud_id.as_str().to_string()),
                name: name.to_string(),
                kind: ObjectKind::Folder,
                content: Vec::new(),
                etag: etag.clone(),
                revision: revision.clone(),
                modified_at: Utc::now(),
            },
        );
        Ok(UploadResult {
            cloud_id: CloudId::new(id).unwrap(),
            etag: Etag::new(etag).unwrap(),
            revision: Revision::new(revision).unwrap(),
        })
    }

    async fn rename(
        &self,
        cloud_id: &CloudId,
        new_name: &str,
        if_match: &Etag,
    ) -> Result<MutationReceipt, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().rename += 1;
        let (etag, revision) = self.fresh_tokens();
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(cloud_id.as_str())
            .ok_or(RemoteError::NotFound)?;
        if node.etag != if_match.as_str() {
            return Err(RemoteError::PreconditionFailed);
        }
        let node = state.nodes.get_mut(cloud_id.as_str()).expect("checked");
        node.name = new_name.to_string();
        node.etag = etag.clone();
        node.revision = revision.clone();
        node.modified_at = Utc::now();
        Ok(MutationReceipt {
            etag: Etag::new(etag).unwrap(),
            revision: Revision::new(revision).unwrap(),
        })
    }

    async fn move_to(
        &self,
        cloud_id: &CloudId,
        new_parent_cloud_id: &CloudId,
        if_match: &Etag,
    ) -> Result<MutationReceipt, RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().move_to += 1;
        let (etag, revision) = self.fresh_tokens();
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(new_parent_cloud_id.as_str()) {
            return Err(RemoteError::NotFound);
        }
        let node = state
            .nodes
            .get(cloud_id.as_str())
            .ok_or(RemoteError::NotFound)?;
        if node.etag != if_match.as_str() {
            return Err(RemoteError::PreconditionFailed);
        }
        let node = state.nodes.get_mut(cloud_id.as_str()).expect("checked");
        node.parent = Some(new_parent_cloud_id.as_str().to_string());
        node.etag = etag.clone();
        node.revision = revision.clone();
        node.modified_at = Utc::now();
        Ok(MutationReceipt {
            etag: Etag::new(etag).unwrap(),
            revision: Revision::new(revision).unwrap(),
        })
    }

    async fn delete(
        &self,
        cloud_id: &CloudId,
        if_match: Option<&Etag>,
    ) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.counts.lock().unwrap().delete += 1;
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(cloud_id.as_str())
            .ok_or(RemoteError::NotFound)?;
        if let Some(expected) = if_match {
            if node.etag != expected.as_str() {
                return Err(RemoteError::PreconditionFailed);
            }
        }
        state.nodes.remove(cloud_id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_and_metadata() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();
        remote.seed_file(&root, "b.txt", b"bee");
        remote.seed_file(&root, "a.txt", b"ay");

        let children = remote.list(&root).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "a.txt");

        let meta = remote.metadata(&children[1].cloud_id).await.unwrap();
        assert_eq!(meta.size, 3);
    }

    #[tokio::test]
    async fn test_download_range_inclusive() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();
        let id = remote.seed_file(&root, "x.bin", b"0123456789");

        assert_eq!(remote.download_range(&id, 2, 5).await.unwrap(), b"2345");
        // End clamps to EOF.
        assert_eq!(remote.download_range(&id, 8, 100).await.unwrap(), b"89");
        // Zero-byte file.
        let empty = remote.seed_file(&root, "e.bin", b"");
        assert_eq!(remote.download_range(&empty, 0, 0).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_conditional_upload_precondition() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();
        let id = remote.seed_file(&root, "doc.txt", b"v1");
        let meta = remote.metadata(&id).await.unwrap();

        // Matching token succeeds and rotates the etag.
        let result = remote
            .upload(&root, "doc.txt", b"v2".to_vec(), Some(&meta.etag))
            .await
            .unwrap();
        assert_ne!(result.etag, meta.etag);

        // Stale token now fails.
        let err = remote
            .upload(&root, "doc.txt", b"v3".to_vec(), Some(&meta.etag))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::PreconditionFailed));
    }

    #[tokio::test]
    async fn test_delete_conditional_and_not_found() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();
        let id = remote.seed_file(&root, "gone.txt", b"x");
        let stale = Etag::new("e999").unwrap();

        assert!(matches!(
            remote.delete(&id, Some(&stale)).await.unwrap_err(),
            RemoteError::PreconditionFailed
        ));
        let meta = remote.metadata(&id).await.unwrap();
        remote.delete(&id, Some(&meta.etag)).await.unwrap();
        assert!(matches!(
            remote.delete(&id, None).await.unwrap_err(),
            RemoteError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_offline_and_auth_faults() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();

        remote.set_offline(true);
        assert!(remote.list(&root).await.unwrap_err().is_transient());
        remote.set_offline(false);

        remote.set_auth_failed(true);
        assert!(matches!(
            remote.list(&root).await.unwrap_err(),
            RemoteError::Auth(_)
        ));
    }

    #[tokio::test]
    async fn test_call_counting() {
        let remote = MemoryRemote::new();
        let root = remote.seed_root();
        remote.upload(&root, "a.txt", b"x".to_vec(), None).await.unwrap();
        remote.list(&root).await.unwrap();
        remote.list(&root).await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls.upload, 1);
        assert_eq!(calls.list, 2);
    }
}
