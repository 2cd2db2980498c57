#[cfg(test)]
mod tests {
    use crate::{MetadataBackend, XattrBackend};
    use dfs_lib::{Attributes, FsError, BLOBSIZE_ATTR, CHECKSUM_PREFIX, ID_ATTR, NAME_ATTR};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_entry() -> (XattrBackend, PathBuf, TempDir) {
        let tmp = TempDir::new().unwrap();
        let entry = tmp.path().join("node");
        std::fs::write(&entry, b"").unwrap();
        (XattrBackend::default(), entry, tmp)
    }

    // ==================== Get/Set Tests ====================

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let (backend, entry, _tmp) = create_test_entry();

        backend.set(&entry, ID_ATTR, b"node-1").await.unwrap();
        let value = backend.get(&entry, ID_ATTR).await.unwrap();
        assert_eq!(value, b"node-1");
    }

    #[tokio::test]
    async fn test_get_missing_attr_is_not_found() {
        let (backend, entry, _tmp) = create_test_entry();
        let err = backend.get(&entry, ID_ATTR).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_missing_entry_is_not_found() {
        let (backend, _entry, tmp) = create_test_entry();
        let missing = tmp.path().join("absent");
        let err = backend.get(&missing, ID_ATTR).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_many_and_get_all() {
        let (backend, entry, _tmp) = create_test_entry();

        let mut attrs = Attributes::new();
        attrs.set_string(ID_ATTR, "node-1");
        attrs.set_string(NAME_ATTR, "a.txt");
        attrs.set_u64(BLOBSIZE_ATTR, 5);
        backend.set_many(&entry, attrs, true).await.unwrap();

        let all = backend.get_all(&entry).await.unwrap();
        assert_eq!(all.get_string(ID_ATTR).as_deref(), Some("node-1"));
        assert_eq!(all.get_string(NAME_ATTR).as_deref(), Some("a.txt"));
        assert_eq!(all.get_u64(BLOBSIZE_ATTR), Some(5));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (backend, entry, _tmp) = create_test_entry();

        backend.set(&entry, NAME_ATTR, b"a.txt").await.unwrap();
        backend.remove(&entry, NAME_ATTR).await.unwrap();
        backend.remove(&entry, NAME_ATTR).await.unwrap();
        assert!(backend.get(&entry, NAME_ATTR).await.is_err());
    }

    // ==================== Copy Tests ====================

    #[tokio::test]
    async fn test_copy_selected_filters_by_predicate() {
        let (backend, src, tmp) = create_test_entry();
        let dst = tmp.path().join("version");
        std::fs::write(&dst, b"").unwrap();

        let mut attrs = Attributes::new();
        attrs.set_string(ID_ATTR, "node-1");
        attrs.set_string(format!("{}sha256", CHECKSUM_PREFIX), "abc");
        backend.set_many(&src, attrs, true).await.unwrap();

        backend
            .copy_selected(&src, &dst, &|key| key.starts_with(CHECKSUM_PREFIX), false)
            .await
            .unwrap();

        let copied = backend.get_all(&dst).await.unwrap();
        assert_eq!(
            copied
                .get_string(&format!("{}sha256", CHECKSUM_PREFIX))
                .as_deref(),
            Some("abc")
        );
        assert!(copied.get_string(ID_ATTR).is_none());
    }

    // ==================== Lock Tests ====================

    #[tokio::test]
    async fn test_lockfile_persists_across_release() {
        let (backend, entry, _tmp) = create_test_entry();
        let lockfile = backend.lockfile_path(&entry);

        {
            let _guard = backend.lock(&entry).await.unwrap();
            assert!(lockfile.exists());
        }
        // Released but never unlinked: the next acquirer locks the same
        // inode any parked waiter is blocked on.
        assert!(lockfile.exists());
        let _guard = backend.lock(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_parks_until_release() {
        let (backend, entry, _tmp) = create_test_entry();
        let backend = std::sync::Arc::new(backend);

        let guard = backend.lock(&entry).await.unwrap();

        let waiter_backend = backend.clone();
        let waiter_entry = entry.clone();
        let waiter = tokio::spawn(async move {
            let _guard = waiter_backend.lock(&waiter_entry).await.unwrap();
            waiter_backend
                .set(&waiter_entry, NAME_ATTR, b"waiter")
                .await
                .unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        backend.set(&entry, NAME_ATTR, b"holder").await.unwrap();

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(backend.get(&entry, NAME_ATTR).await.unwrap(), b"waiter");
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let (backend, entry, _tmp) = create_test_entry();
        let backend = std::sync::Arc::new(backend);

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let backend = backend.clone();
            let entry = entry.clone();
            handles.push(tokio::spawn(async move {
                let mut attrs = Attributes::new();
                attrs.set_u64(BLOBSIZE_ATTR, i);
                attrs.set_string(NAME_ATTR, format!("file-{}", i));
                backend.set_many(&entry, attrs, true).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Writers serialized, so the two attributes come from one writer.
        let all = backend.get_all(&entry).await.unwrap();
        let size = all.get_u64(BLOBSIZE_ATTR).unwrap();
        assert_eq!(
            all.get_string(NAME_ATTR).as_deref(),
            Some(format!("file-{}", size).as_str())
        );
    }
}
