#[cfg(test)]
mod tests {
    use crate::Tree;
    use chrono::{Duration, Utc};
    use dfs_lib::{
        format_mtime, Attributes, FsError, Options, RequestContext, User, BLOBID_ATTR,
        BLOBSIZE_ATTR, MTIME_ATTR, TYPE_ATTR,
    };
    use fs_node::{Lookup, Node, REVISION_DELIMITER};
    use meta_store::{Blobstore, FsBlobstore, MetadataBackend, XattrBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_tree() -> (Arc<Tree>, Arc<FsBlobstore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn MetadataBackend> = Arc::new(XattrBackend::default());
        let lookup = Lookup::new(tmp.path(), backend);
        let blobstore = Arc::new(FsBlobstore::new(tmp.path().join("spaces")));
        let tree = Tree::new(lookup, blobstore.clone(), Options::new(tmp.path()));
        (Arc::new(tree), blobstore, tmp)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(User::new("marie"))
    }

    async fn create_test_space(tree: &Tree) -> Node {
        tree.setup().await.unwrap();
        tree.create_space(&User::new("marie"), None, None)
            .await
            .unwrap()
    }

    /// A live file plus one older revision, the way an overwriting
    /// upload leaves them behind.
    async fn make_file_with_revision(
        tree: &Tree,
        blobstore: &FsBlobstore,
        tmp: &TempDir,
        root: &Node,
    ) -> (Node, String) {
        let mut node = root.child("a.txt").await.unwrap();
        tree.touch_file(&mut node).await.unwrap();

        let old_mtime = Utc::now() - Duration::seconds(60);

        // Live state: blob "new", 8 bytes.
        let source = tmp.path().join("live.bin");
        tokio::fs::write(&source, b"new-data").await.unwrap();
        blobstore
            .upload(&root.space_id, "blob-new", 8, &source)
            .await
            .unwrap();
        let mut attrs = Attributes::new();
        attrs.set_string(BLOBID_ATTR, "blob-new");
        attrs.set_u64(BLOBSIZE_ATTR, 8);
        node.set_metadata(attrs).await.unwrap();
        tree.propagate(root, 8, &Utc::now()).await.unwrap();

        // Revision: blob "old", 5 bytes, at the old mtime.
        let source = tmp.path().join("old.bin");
        tokio::fs::write(&source, b"hello").await.unwrap();
        blobstore
            .upload(&root.space_id, "blob-old", 5, &source)
            .await
            .unwrap();
        let ts = format_mtime(&old_mtime);
        let rev_path = tree
            .lookup()
            .version_path(&root.space_id, &node.id, &ts);
        tokio::fs::write(&rev_path, b"").await.unwrap();
        let mut rev_attrs = Attributes::new();
        rev_attrs.set_string(TYPE_ATTR, "file");
        rev_attrs.set_string(BLOBID_ATTR, "blob-old");
        rev_attrs.set_u64(BLOBSIZE_ATTR, 5);
        rev_attrs.set_string(MTIME_ATTR, &ts);
        tree.lookup()
            .backend()
            .set_many(&rev_path, rev_attrs, true)
            .await
            .unwrap();

        let key = format!("{}{}{}", node.id, REVISION_DELIMITER, ts);
        (root.child("a.txt").await.unwrap(), key)
    }

    // ==================== Listing Tests ====================

    #[tokio::test]
    async fn test_list_revisions() {
        let (tree, blobstore, tmp) = create_test_tree();
        let root = create_test_space(&tree).await;
        let (node, key) = make_file_with_revision(&tree, &blobstore, &tmp, &root).await;

        let revisions = tree.list_revisions(&node).await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].key, key);
        assert_eq!(revisions[0].size, 5);
    }

    #[tokio::test]
    async fn test_list_revisions_empty() {
        let (tree, _bs, _tmp) = create_test_tree();
        let root = create_test_space(&tree).await;
        let mut node = root.child("a.txt").await.unwrap();
        tree.touch_file(&mut node).await.unwrap();

        assert!(tree.list_revisions(&node).await.unwrap().is_empty());
    }

    // ==================== Restore Tests ====================

    #[tokio::test]
    async fn test_restore_revision_swaps_live_state() {
        let (tree, blobstore, tmp) = create_test_tree();
        let root = create_test_space(&tree).await;
        let (node, key) = make_file_with_revision(&tree, &blobstore, &tmp, &root).await;
        let live_mtime = node.get_mtime().await.unwrap();

        tree.restore_revision(&ctx(), &node, &key).await.unwrap();

        let restored = root.child("a.txt").await.unwrap();
        assert_eq!(restored.blob_id.as_deref(), Some("blob-old"));
        assert_eq!(restored.blob_size, 5);

        // The previous live state became a revision of its own.
        let revisions = tree.list_revisions(&restored).await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].mtime, live_mtime);
        assert_eq!(revisions[0].size, 8);

        // The size delta flowed up the chain.
        let attrs = root
            .read_metadata(&[dfs_lib::TREESIZE_ATTR])
            .await
            .unwrap();
        assert_eq!(attrs.get_u64(dfs_lib::TREESIZE_ATTR), Some(5));
    }

    #[tokio::test]
    async fn test_restore_unknown_revision_is_not_found() {
        let (tree, blobstore, tmp) = create_test_tree();
        let root = create_test_space(&tree).await;
        let (node, _key) = make_file_with_revision(&tree, &blobstore, &tmp, &root).await;

        let bogus = format!(
            "{}{}{}",
            node.id,
            REVISION_DELIMITER,
            format_mtime(&(Utc::now() + Duration::days(1)))
        );
        let err = tree
            .restore_revision(&ctx(), &node, &bogus)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = tree
            .restore_revision(&ctx(), &node, "someone-elses-id.REV.x")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArg(_)));
    }

    // ==================== Delete Tests ====================

    #[tokio::test]
    async fn test_delete_revision_removes_blob() {
        let (tree, blobstore, tmp) = create_test_tree();
        let root = create_test_space(&tree).await;
        let (node, key) = make_file_with_revision(&tree, &blobstore, &tmp, &root).await;

        tree.delete_revision(&ctx(), &node, &key).await.unwrap();

        assert!(tree.list_revisions(&node).await.unwrap().is_empty());
        let err = blobstore
            .download(&root.space_id, "blob-old")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        // The live blob is untouched.
        blobstore.download(&root.space_id, "blob-new").await.unwrap();
    }
}
