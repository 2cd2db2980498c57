#[cfg(test)]
mod tests {
    use crate::DfsEngine;
    use chrono::Utc;
    use dfs_lib::{
        Event, FsError, MemoryEventStream, MemoryStatCache, Options, PostprocessingFinished,
        PostprocessingOutcome, Reference, RequestContext, ResourceId, StatCache, UploadReady,
        User, VirusscanFinished,
    };
    use fs_node::LockInfo;
    use meta_store::{FsBlobstore, MetadataBackend, XattrBackend};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Fixture {
        engine: Arc<DfsEngine>,
        stream: Arc<MemoryEventStream>,
        stat_cache: Arc<MemoryStatCache>,
        space_id: String,
        _tmp: TempDir,
    }

    async fn create_fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn MetadataBackend> = Arc::new(XattrBackend::default());
        let blobstore = Arc::new(FsBlobstore::new(tmp.path().join("spaces")));
        let stream = Arc::new(MemoryEventStream::new(64));
        let stat_cache = Arc::new(MemoryStatCache::new());

        let engine = DfsEngine::new(
            Options::new(tmp.path()),
            backend,
            blobstore,
            stream.clone(),
            stat_cache.clone(),
        )
        .await
        .unwrap();

        let root = engine.create_space(&ctx(), None).await.unwrap();
        Fixture {
            engine,
            stream,
            stat_cache,
            space_id: root.space_id,
            _tmp: tmp,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(User::new("marie"))
    }

    fn file_ref(fixture: &Fixture, path: &str) -> Reference {
        Reference::relative(ResourceId::space_root(&fixture.space_id), path)
    }

    /// Transfer and seal an upload; the node stays in processing until a
    /// postprocessing event arrives.
    async fn upload(
        fixture: &Fixture,
        path: &str,
        content: &[u8],
        headers: upload_store::UploadHeaders,
    ) -> (String, ResourceId) {
        let session_id = fixture
            .engine
            .initiate_upload(
                &ctx(),
                &file_ref(fixture, path),
                content.len() as u64,
                None,
                headers,
            )
            .await
            .unwrap();
        let mut reader = content;
        fixture
            .engine
            .upload_chunk(&session_id, &mut reader)
            .await
            .unwrap();
        let resource = fixture.engine.finish_upload(&session_id).await.unwrap();
        (session_id, resource)
    }

    async fn publish_outcome(
        fixture: &Fixture,
        upload_id: &str,
        outcome: Option<PostprocessingOutcome>,
    ) {
        use dfs_lib::EventStream;
        fixture
            .stream
            .publish(Event::PostprocessingFinished(PostprocessingFinished {
                upload_id: upload_id.to_string(),
                outcome,
                executing_user: User::new("marie"),
            }))
            .await
            .unwrap();
    }

    async fn wait_upload_ready(
        rx: &mut broadcast::Receiver<Event>,
        upload_id: &str,
    ) -> UploadReady {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Event::UploadReady(ready) = rx.recv().await.unwrap() {
                    if ready.upload_id == upload_id {
                        return ready;
                    }
                }
            }
        })
        .await
        .expect("no UploadReady within timeout")
    }

    async fn complete_upload(fixture: &Fixture, path: &str, content: &[u8]) -> ResourceId {
        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, resource) =
            upload(fixture, path, content, Default::default()).await;
        publish_outcome(fixture, &session_id, Some(PostprocessingOutcome::Continue)).await;
        let ready = wait_upload_ready(&mut rx, &session_id).await;
        assert!(!ready.failed);
        resource
    }

    async fn treesize_of_root(fixture: &Fixture) -> u64 {
        let info = fixture
            .engine
            .get_md(&ctx(), &Reference::id(ResourceId::space_root(&fixture.space_id)))
            .await
            .unwrap();
        info.size
    }

    // ==================== Upload Scenarios ====================

    #[tokio::test]
    async fn test_new_file_upload_end_to_end() {
        let fixture = create_fixture().await;

        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, resource) =
            upload(&fixture, "a.txt", b"hello", Default::default()).await;

        // Committed but unprocessed: invisible to stat.
        let err = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        publish_outcome(&fixture, &session_id, Some(PostprocessingOutcome::Continue)).await;
        let ready = wait_upload_ready(&mut rx, &session_id).await;
        assert!(!ready.failed);
        assert_eq!(ready.file_ref.resource_id, resource);

        let info = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.id, resource);
        assert_eq!(treesize_of_root(&fixture).await, 5);

        // The blob is downloadable and matches what was sent.
        let mut reader = fixture
            .engine
            .download(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");

        // The session is gone after a successful finalize.
        assert!(fixture
            .engine
            .uploads
            .get(&session_id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_version_with_old_mtime() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;

        let before = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();

        let headers = upload_store::UploadHeaders {
            if_match: Some(before.etag.clone()),
            ..Default::default()
        };
        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, _) = upload(&fixture, "a.txt", b"new-data", headers).await;
        publish_outcome(&fixture, &session_id, Some(PostprocessingOutcome::Continue)).await;
        wait_upload_ready(&mut rx, &session_id).await;

        let after = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(after.size, 8);
        assert_eq!(after.id, before.id);
        assert!(after.mtime > before.mtime);
        assert_eq!(treesize_of_root(&fixture).await, 8);

        let revisions = fixture
            .engine
            .list_revisions(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].mtime, before.mtime);
        assert_eq!(revisions[0].size, 5);
    }

    #[tokio::test]
    async fn test_precondition_failure_leaves_node_unchanged() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;
        let before = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();

        let headers = upload_store::UploadHeaders {
            if_match: Some("\"deadbeef\"".to_string()),
            ..Default::default()
        };
        let session_id = fixture
            .engine
            .initiate_upload(&ctx(), &file_ref(&fixture, "a.txt"), 8, None, headers)
            .await
            .unwrap();
        let mut reader: &[u8] = b"new-data";
        fixture
            .engine
            .upload_chunk(&session_id, &mut reader)
            .await
            .unwrap();
        let err = fixture.engine.finish_upload(&session_id).await.unwrap_err();
        assert!(err.is_aborted());

        let after = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(after.size, before.size);
        assert_eq!(after.etag, before.etag);
        assert!(after.lock.is_none());
        // The aborted session is kept for inspection and retry.
        fixture.engine.uploads.get(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_upload_with_if_none_match_star_aborts() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;

        let headers = upload_store::UploadHeaders {
            if_none_match: Some("*".to_string()),
            ..Default::default()
        };
        let session_id = fixture
            .engine
            .initiate_upload(&ctx(), &file_ref(&fixture, "a.txt"), 5, None, headers)
            .await
            .unwrap();
        let mut reader: &[u8] = b"other";
        fixture
            .engine
            .upload_chunk(&session_id, &mut reader)
            .await
            .unwrap();
        let err = fixture.engine.finish_upload(&session_id).await.unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_outcome_reverts_and_reports_failed() {
        let fixture = create_fixture().await;

        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, _) = upload(&fixture, "a.txt", b"hello", Default::default()).await;
        publish_outcome(&fixture, &session_id, Some(PostprocessingOutcome::Abort)).await;
        let ready = wait_upload_ready(&mut rx, &session_id).await;
        assert!(ready.failed);

        // New node was reverted away; the session remains retryable.
        let err = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        fixture.engine.uploads.get(&session_id).await.unwrap();
        assert_eq!(treesize_of_root(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_treated_as_abort() {
        let fixture = create_fixture().await;

        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, _) = upload(&fixture, "a.txt", b"hello", Default::default()).await;
        publish_outcome(&fixture, &session_id, None).await;
        let ready = wait_upload_ready(&mut rx, &session_id).await;
        assert!(ready.failed);
    }

    #[tokio::test]
    async fn test_replayed_outcome_is_deduplicated() {
        let fixture = create_fixture().await;

        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (session_id, _) = upload(&fixture, "a.txt", b"hello", Default::default()).await;
        publish_outcome(&fixture, &session_id, Some(PostprocessingOutcome::Continue)).await;
        wait_upload_ready(&mut rx, &session_id).await;

        // Replay the event: converges to the same state, no second
        // UploadReady.
        publish_outcome(&fixture, &session_id, Some(PostprocessingOutcome::Continue)).await;
        let extra = timeout(Duration::from_millis(500), async {
            loop {
                if let Event::UploadReady(ready) = rx.recv().await.unwrap() {
                    return ready;
                }
            }
        })
        .await;
        assert!(extra.is_err());

        let info = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(treesize_of_root(&fixture).await, 5);

        fixture.engine.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_uploads_to_distinct_children() {
        let fixture = create_fixture().await;

        use dfs_lib::EventStream;
        let mut rx = fixture.stream.subscribe();
        let (s1, _) = upload(&fixture, "f1.txt", b"aaa", Default::default()).await;
        let (s2, _) = upload(&fixture, "f2.txt", b"bbbb", Default::default()).await;

        publish_outcome(&fixture, &s1, Some(PostprocessingOutcome::Continue)).await;
        publish_outcome(&fixture, &s2, Some(PostprocessingOutcome::Continue)).await;
        wait_upload_ready(&mut rx, &s1).await;
        wait_upload_ready(&mut rx, &s2).await;

        assert_eq!(treesize_of_root(&fixture).await, 7);
        let listed = fixture
            .engine
            .list_folder(&ctx(), &Reference::id(ResourceId::space_root(&fixture.space_id)))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    // ==================== Virus Scan Scenarios ====================

    #[tokio::test]
    async fn test_virus_delete_restores_newest_version() {
        let fixture = create_fixture().await;
        let resource = complete_upload(&fixture, "a.txt", b"hello").await;
        complete_upload(&fixture, "a.txt", b"infected").await;
        assert_eq!(treesize_of_root(&fixture).await, 8);

        fixture
            .stat_cache
            .put_stat("marie", &resource, "\"etag\"".to_string());

        use dfs_lib::EventStream;
        fixture
            .stream
            .publish(Event::VirusscanFinished(VirusscanFinished {
                upload_id: String::new(),
                resource_id: Some(resource.clone()),
                outcome: Some(PostprocessingOutcome::Delete),
                description: "Eicar-Test-Signature".to_string(),
                scandate: Utc::now(),
                executing_user: User::new("marie"),
                error_msg: String::new(),
            }))
            .await
            .unwrap();

        // The predecessor version becomes live again and the infected
        // revision disappears.
        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(info) = fixture
                    .engine
                    .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
                    .await
                {
                    if info.size == 5 {
                        let revisions = fixture
                            .engine
                            .list_revisions(&ctx(), &file_ref(&fixture, "a.txt"))
                            .await
                            .unwrap();
                        if revisions.is_empty() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("version was not restored");

        assert!(fixture.stat_cache.get_stat("marie", &resource).is_none());
    }

    #[tokio::test]
    async fn test_virus_delete_without_versions_purges() {
        let fixture = create_fixture().await;
        let resource = complete_upload(&fixture, "a.txt", b"infected").await;

        use dfs_lib::EventStream;
        fixture
            .stream
            .publish(Event::VirusscanFinished(VirusscanFinished {
                upload_id: String::new(),
                resource_id: Some(resource.clone()),
                outcome: Some(PostprocessingOutcome::Delete),
                description: "Eicar-Test-Signature".to_string(),
                scandate: Utc::now(),
                executing_user: User::new("marie"),
                error_msg: String::new(),
            }))
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                if fixture
                    .engine
                    .get_md(&ctx(), &file_ref(&fixture, "a.txt"))
                    .await
                    .is_err()
                {
                    // Deleted; wait until the recycle bin is empty too.
                    let recycle = fixture
                        .engine
                        .list_recycle(&ctx(), &fixture.space_id)
                        .await
                        .unwrap();
                    if recycle.is_empty() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("infected node was not purged");
    }

    #[tokio::test]
    async fn test_clean_scan_stores_scan_metadata() {
        let fixture = create_fixture().await;
        let resource = complete_upload(&fixture, "a.txt", b"hello").await;

        use dfs_lib::EventStream;
        fixture
            .stream
            .publish(Event::VirusscanFinished(VirusscanFinished {
                upload_id: String::new(),
                resource_id: Some(resource.clone()),
                outcome: Some(PostprocessingOutcome::Continue),
                description: String::new(),
                scandate: Utc::now(),
                executing_user: User::new("marie"),
                error_msg: String::new(),
            }))
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                let node = fixture
                    .engine
                    .lookup()
                    .node_from_id(&resource.space_id, &resource.opaque_id)
                    .await
                    .unwrap();
                let attrs = node
                    .read_metadata(&[dfs_lib::SCAN_DATE_ATTR])
                    .await
                    .unwrap();
                if attrs.get_string(dfs_lib::SCAN_DATE_ATTR).is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("scan metadata was not stored");
    }

    // ==================== Tree Operation Scenarios ====================

    #[tokio::test]
    async fn test_move_propagates_both_chains() {
        let fixture = create_fixture().await;
        fixture
            .engine
            .create_dir(&ctx(), &file_ref(&fixture, "A"))
            .await
            .unwrap();
        fixture
            .engine
            .create_dir(&ctx(), &file_ref(&fixture, "B"))
            .await
            .unwrap();
        complete_upload(&fixture, "A/f", &[0u8; 10]).await;

        fixture
            .engine
            .move_node(
                &ctx(),
                &file_ref(&fixture, "A/f"),
                &file_ref(&fixture, "B/f"),
            )
            .await
            .unwrap();

        let a = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "A"))
            .await
            .unwrap();
        let b = fixture
            .engine
            .get_md(&ctx(), &file_ref(&fixture, "B"))
            .await
            .unwrap();
        assert_eq!(a.size, 0);
        assert_eq!(b.size, 10);
        assert_eq!(treesize_of_root(&fixture).await, 10);
    }

    #[tokio::test]
    async fn test_move_of_locked_node_requires_lock_id() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;

        fixture
            .engine
            .set_lock(
                &ctx(),
                &file_ref(&fixture, "a.txt"),
                &LockInfo {
                    lock_id: "l1".to_string(),
                    user_id: "marie".to_string(),
                    app_name: None,
                    expiration: None,
                },
            )
            .await
            .unwrap();

        let err = fixture
            .engine
            .move_node(
                &ctx(),
                &file_ref(&fixture, "a.txt"),
                &file_ref(&fixture, "b.txt"),
            )
            .await
            .unwrap_err();
        assert!(err.is_locked());

        fixture
            .engine
            .move_node(
                &ctx().with_lock_id("l1"),
                &file_ref(&fixture, "a.txt"),
                &file_ref(&fixture, "b.txt"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_restore_round_trip() {
        let fixture = create_fixture().await;
        let resource = complete_upload(&fixture, "a.txt", b"hello").await;

        fixture
            .engine
            .delete(&ctx(), &file_ref(&fixture, "a.txt"))
            .await
            .unwrap();
        assert_eq!(treesize_of_root(&fixture).await, 0);

        let recycle = fixture
            .engine
            .list_recycle(&ctx(), &fixture.space_id)
            .await
            .unwrap();
        assert_eq!(recycle.len(), 1);
        assert_eq!(recycle[0].origin, "/a.txt");

        let restored = fixture
            .engine
            .restore_recycle_item(&ctx(), &fixture.space_id, &resource.opaque_id, None)
            .await
            .unwrap();
        assert_eq!(restored.id, resource.opaque_id);
        assert_eq!(treesize_of_root(&fixture).await, 5);
    }

    #[tokio::test]
    async fn test_permissions_gate_operations() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;

        let stranger = RequestContext::new(User::new("stranger"));
        let err = fixture
            .engine
            .get_md(&stranger, &file_ref(&fixture, "a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied(_)));

        let err = fixture
            .engine
            .delete(&stranger, &file_ref(&fixture, "a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_create_dir_in_missing_parent_is_not_found() {
        let fixture = create_fixture().await;
        let err = fixture
            .engine
            .create_dir(&ctx(), &file_ref(&fixture, "missing/dir"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_quota_reporting() {
        let fixture = create_fixture().await;
        complete_upload(&fixture, "a.txt", b"hello").await;

        let root_ref = Reference::id(ResourceId::space_root(&fixture.space_id));
        let (total, used, _remaining) =
            fixture.engine.get_quota(&ctx(), &root_ref).await.unwrap();
        assert_eq!(total, 0);
        assert_eq!(used, 5);
    }
}
