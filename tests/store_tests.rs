mod common;

use bytes::Bytes;

use aasx_store::config::GcMode;
use aasx_store::error::AppError;
use aasx_store::models::{PackageKind, PageQuery};
use aasx_store::services::hash::content_hash;
use aasx_store::services::{AttachmentService, BlobService, PackageService};
use aasx_store::storage::StorageProvider;

use common::{key, new_attachment, TestStore, BASE_URL, MANUAL, THUMBNAIL};

// -- Blob store -------------------------------------------------------------

#[tokio::test]
async fn identical_content_is_stored_once() {
    let store = TestStore::new(GcMode::Eager).await;
    let data = Bytes::from_static(b"same bytes");

    let first = BlobService::put(&store.db, store.storage.as_ref(), data.clone())
        .await
        .unwrap();
    let second = BlobService::put(&store.db, store.storage.as_ref(), data.clone())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first, content_hash(&data));

    let blob = BlobService::stat(&store.db, &first).await.unwrap();
    assert_eq!(blob.reference_count, 2);
    assert_eq!(blob.size_bytes, data.len() as i64);

    let page = BlobService::list(&store.db, PageQuery::default()).await.unwrap();
    assert_eq!(page.total_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_puts_count_every_reference() {
    let store = TestStore::new(GcMode::Eager).await;
    let data = Bytes::from_static(b"raced content");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let db = store.db.clone();
        let storage = store.storage.clone();
        let data = data.clone();
        handles.push(tokio::spawn(async move {
            BlobService::put(&db, storage.as_ref(), data).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let blob = BlobService::stat(&store.db, &content_hash(&data)).await.unwrap();
    assert_eq!(blob.reference_count, 16);
    let page = BlobService::list(&store.db, PageQuery::default()).await.unwrap();
    assert_eq!(page.total_count, 1);
}

#[tokio::test]
async fn increment_on_unknown_hash_is_not_found() {
    let store = TestStore::new(GcMode::Eager).await;
    let err = BlobService::increment_ref(&store.db, &content_hash(b"never stored"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn decrement_at_zero_is_a_consistency_violation() {
    let store = TestStore::new(GcMode::Deferred).await;
    let hash = BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"x1"))
        .await
        .unwrap();

    let remaining =
        BlobService::decrement_ref(&store.db, store.storage.as_ref(), store.gc_mode(), &hash)
            .await
            .unwrap();
    assert_eq!(remaining, 0);

    let err = BlobService::decrement_ref(&store.db, store.storage.as_ref(), store.gc_mode(), &hash)
        .await
        .unwrap_err();
    assert!(err.is_consistency_violation());

    let blob = BlobService::stat(&store.db, &hash).await.unwrap();
    assert_eq!(blob.reference_count, 0);
}

#[tokio::test]
async fn zero_count_blob_is_never_served() {
    let store = TestStore::new(GcMode::Deferred).await;
    let hash = BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"gone"))
        .await
        .unwrap();
    BlobService::decrement_ref(&store.db, store.storage.as_ref(), store.gc_mode(), &hash)
        .await
        .unwrap();

    let err = BlobService::get(&store.db, store.storage.as_ref(), &hash)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // Re-ingesting the content revives it
    BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"gone"))
        .await
        .unwrap();
    let data = BlobService::get(&store.db, store.storage.as_ref(), &hash)
        .await
        .unwrap();
    assert_eq!(data.as_ref(), b"gone");
}

#[tokio::test]
async fn sweep_erases_only_zero_count_blobs() {
    let store = TestStore::new(GcMode::Deferred).await;
    let dead = BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"dead"))
        .await
        .unwrap();
    let live = BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"live"))
        .await
        .unwrap();
    BlobService::decrement_ref(&store.db, store.storage.as_ref(), store.gc_mode(), &dead)
        .await
        .unwrap();

    // Deferred mode keeps the row until the sweep
    assert!(BlobService::stat(&store.db, &dead).await.is_ok());

    let erased = BlobService::sweep(&store.db, store.storage.as_ref()).await.unwrap();
    assert_eq!(erased, 1);
    assert!(BlobService::stat(&store.db, &dead).await.unwrap_err().is_not_found());
    assert!(!store.storage.exists(&dead).await.unwrap());
    assert!(store.storage.exists(&live).await.unwrap());
}

#[tokio::test]
async fn eager_mode_erases_at_zero() {
    let store = TestStore::new(GcMode::Eager).await;
    let hash = BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(b"eager"))
        .await
        .unwrap();
    BlobService::decrement_ref(&store.db, store.storage.as_ref(), store.gc_mode(), &hash)
        .await
        .unwrap();

    assert!(BlobService::stat(&store.db, &hash).await.unwrap_err().is_not_found());
    assert!(!store.storage.exists(&hash).await.unwrap());
}

#[tokio::test]
async fn malformed_hash_is_bad_request() {
    let store = TestStore::new(GcMode::Eager).await;
    let err = BlobService::get(&store.db, store.storage.as_ref(), "../../etc/passwd")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

// -- Attachment metadata ------------------------------------------------------

#[tokio::test]
async fn deleting_records_releases_shared_content() {
    let store = TestStore::new(GcMode::Eager).await;
    let data = Bytes::from_static(MANUAL);
    let first = key("urn:shell:1", "urn:sm:docs", "Manual");
    let second = key("urn:shell:2", "urn:sm:docs", "Manual");

    let meta = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(first.clone(), "manual.pdf"),
        data.clone(),
    )
    .await
    .unwrap();
    AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(second.clone(), "manual.pdf"),
        data.clone(),
    )
    .await
    .unwrap();
    let hash = meta.content_hash;
    assert_eq!(BlobService::stat(&store.db, &hash).await.unwrap().reference_count, 2);

    AttachmentService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), &first)
        .await
        .unwrap();
    assert_eq!(BlobService::stat(&store.db, &hash).await.unwrap().reference_count, 1);
    let bytes = BlobService::get(&store.db, store.storage.as_ref(), &hash)
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), MANUAL);

    AttachmentService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), &second)
        .await
        .unwrap();
    assert!(BlobService::get(&store.db, store.storage.as_ref(), &hash)
        .await
        .unwrap_err()
        .is_not_found());

    // A repeated delete is reported, not swallowed
    let err = AttachmentService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), &second)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn paging_keeps_insertion_order_and_total() {
    let store = TestStore::new(GcMode::Eager).await;
    for i in 0..45 {
        AttachmentService::create(
            &store.db,
            store.storage.as_ref(),
            new_attachment(key("urn:shell:1", "urn:sm:docs", &format!("Doc{:02}", i)), "doc.pdf"),
            Bytes::from(format!("document {}", i)),
        )
        .await
        .unwrap();
    }
    // Another package must not leak into the listing
    AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(key("urn:shell:2", "urn:sm:docs", "Doc00"), "doc.pdf"),
        Bytes::from_static(b"other"),
    )
    .await
    .unwrap();

    let mut seen = Vec::new();
    for (offset, expected) in [(0, 20), (20, 20), (40, 5)] {
        let page = AttachmentService::list_by_package(
            &store.db,
            "urn:shell:1",
            PageQuery::new(offset, 20),
        )
        .await
        .unwrap();
        assert_eq!(page.total_count, 45);
        assert_eq!(page.items.len(), expected);
        seen.extend(page.items.into_iter().map(|m| m.local_element_id));
    }
    let expected: Vec<String> = (0..45).map(|i| format!("Doc{:02}", i)).collect();
    assert_eq!(seen, expected);

    let empty = AttachmentService::list_by_package(&store.db, "urn:shell:1", PageQuery::new(0, 0))
        .await
        .unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.total_count, 45);

    let all = AttachmentService::list_all(&store.db, PageQuery::new(40, 20)).await.unwrap();
    assert_eq!(all.total_count, 46);
    assert_eq!(all.items.len(), 6);
}

#[tokio::test]
async fn delete_of_missing_key_is_not_found() {
    let store = TestStore::new(GcMode::Eager).await;
    let err = AttachmentService::delete(
        &store.db,
        store.storage.as_ref(),
        store.gc_mode(),
        &key("urn:shell:1", "urn:sm:docs", "Nothing"),
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn creating_an_existing_key_conflicts_without_touching_counts() {
    let store = TestStore::new(GcMode::Eager).await;
    let k = key("urn:shell:1", "urn:sm:docs", "Manual");
    let meta = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(k.clone(), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap();

    let err = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(k.clone(), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        BlobService::stat(&store.db, &meta.content_hash).await.unwrap().reference_count,
        1
    );
}

#[tokio::test]
async fn create_for_existing_shares_the_blob() {
    let store = TestStore::new(GcMode::Eager).await;
    let meta = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(key("urn:shell:1", "urn:sm:docs", "Manual"), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap();

    let copy = AttachmentService::create_for_existing(
        &store.db,
        new_attachment(key("urn:shell:1", "urn:sm:docs", "Copy"), "manual.pdf"),
        &meta.content_hash,
    )
    .await
    .unwrap();
    assert_eq!(copy.content_hash, meta.content_hash);
    assert_eq!(
        BlobService::stat(&store.db, &meta.content_hash).await.unwrap().reference_count,
        2
    );

    let err = AttachmentService::create_for_existing(
        &store.db,
        new_attachment(key("urn:shell:1", "urn:sm:docs", "Ghost"), "ghost.pdf"),
        &content_hash(b"never stored"),
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn record_pointing_at_missing_blob_is_a_consistency_violation() {
    let store = TestStore::new(GcMode::Eager).await;
    let k = key("urn:shell:1", "urn:sm:docs", "Manual");
    let meta = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(k.clone(), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap();

    sqlx::query("DELETE FROM blobs WHERE hash = ?")
        .bind(&meta.content_hash)
        .execute(store.db.pool())
        .await
        .unwrap();

    let mismatches = BlobService::verify(&store.db).await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].content_hash, meta.content_hash);
    assert_eq!(mismatches[0].actual_count, 1);

    let err = AttachmentService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), &k)
        .await
        .unwrap_err();
    assert!(err.is_consistency_violation());
    // The failed unit leaves the record in place
    assert!(AttachmentService::get(&store.db, &k).await.is_ok());
}

#[tokio::test]
async fn verify_reports_drifted_counts() {
    let store = TestStore::new(GcMode::Eager).await;
    let meta = AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(key("urn:shell:1", "urn:sm:docs", "Manual"), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap();
    assert!(BlobService::verify(&store.db).await.unwrap().is_empty());

    // A bare put takes a reference no record accounts for
    BlobService::put(&store.db, store.storage.as_ref(), Bytes::from_static(MANUAL))
        .await
        .unwrap();

    let mismatches = BlobService::verify(&store.db).await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].content_hash, meta.content_hash);
    assert_eq!(mismatches[0].stored_count, 2);
    assert_eq!(mismatches[0].actual_count, 1);
}

// -- Package files ------------------------------------------------------------

#[tokio::test]
async fn aasx_ingestion_indexes_and_rewrites_attachments() {
    let store = TestStore::new(GcMode::Eager).await;
    let report = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();

    let keys: Vec<String> = report.attachments.iter().map(|m| m.key().to_string()).collect();
    assert_eq!(
        keys,
        vec![
            "urn:shell:pump::urn:asset:pump::thumbnail.png",
            "urn:shell:pump::urn:sm:docs::Manual",
            "urn:shell:pump::urn:sm:docs::CE",
        ]
    );
    assert!(report.skipped.is_empty());
    assert!(report.unresolved.is_empty());

    let manual_hash = content_hash(MANUAL);
    let manual = BlobService::stat(&store.db, &manual_hash).await.unwrap();
    assert_eq!(manual.reference_count, 2);
    let thumb = &report.attachments[0];
    assert_eq!(thumb.content_hash, content_hash(THUMBNAIL));
    assert_eq!(thumb.content_type, "image/png");
    assert_eq!(thumb.package_file.as_deref(), Some("pump.aasx"));

    let expected_url = format!("{}/api/transformer/download/{}.pdf", BASE_URL, manual_hash);
    let environment = PackageService::environment(&store.db, "pump.aasx").await.unwrap();
    let elements = &environment["submodels"][0]["submodelElements"];
    assert_eq!(elements[0]["value"], expected_url.as_str());
    assert_eq!(elements[1]["value"][0]["value"], expected_url.as_str());
    assert_eq!(elements[2]["value"], "https://example.com/pump.pdf");

    let names = PackageService::list_file_names(&store.db, None, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(names.items, vec!["pump.aasx".to_string()]);

    let err = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn second_package_skips_indexed_keys() {
    let store = TestStore::new(GcMode::Eager).await;
    PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();

    let report = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump-copy.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();
    assert!(report.attachments.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(
        BlobService::stat(&store.db, &content_hash(MANUAL)).await.unwrap().reference_count,
        2
    );
}

#[tokio::test]
async fn json_environment_reuses_live_content() {
    let store = TestStore::new(GcMode::Eager).await;
    let aasx = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();

    // The derived environment re-uploaded under another shell id
    let mut environment = aasx.environment.clone();
    environment["assetAdministrationShells"][0]["id"] = "urn:shell:pump-2".into();
    let data = Bytes::from(serde_json::to_vec(&environment).unwrap());

    let report = PackageService::ingest_json(&store.db, BASE_URL, "pump-2.json", data)
        .await
        .unwrap();
    assert_eq!(report.attachments.len(), 3);
    assert!(report.unresolved.is_empty());
    assert_eq!(
        BlobService::stat(&store.db, &content_hash(MANUAL)).await.unwrap().reference_count,
        4
    );
    assert!(BlobService::verify(&store.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn package_delete_cascades_to_its_attachments() {
    let store = TestStore::new(GcMode::Eager).await;
    PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();
    // A record from elsewhere sharing the manual keeps it alive
    AttachmentService::create(
        &store.db,
        store.storage.as_ref(),
        new_attachment(key("urn:shell:other", "urn:sm:docs", "Manual"), "manual.pdf"),
        Bytes::from_static(MANUAL),
    )
    .await
    .unwrap();

    let removed = PackageService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), "pump.aasx")
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let manual = BlobService::stat(&store.db, &content_hash(MANUAL)).await.unwrap();
    assert_eq!(manual.reference_count, 1);
    assert!(BlobService::stat(&store.db, &content_hash(THUMBNAIL))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(BlobService::verify(&store.db).await.unwrap().is_empty());

    let err = PackageService::delete(&store.db, store.storage.as_ref(), store.gc_mode(), "pump.aasx")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn xml_only_package_is_rejected() {
    let store = TestStore::new(GcMode::Eager).await;
    let data = common::build_aasx(&[
        ("_rels/.rels", b"<Relationships/>"),
        ("aasx/env.aas.xml", b"<environment/>"),
    ]);
    let err = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "xml.aasx",
        data,
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let names = PackageService::list_file_names(&store.db, None, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(names.total_count, 0);
}

fn empty_environment() -> Bytes {
    Bytes::from_static(br#"{"assetAdministrationShells": [], "submodels": []}"#)
}

#[tokio::test]
async fn listings_without_limit_return_everything() {
    let store = TestStore::new(GcMode::Eager).await;
    for i in 0..25 {
        PackageService::ingest_json(&store.db, BASE_URL, &format!("env-{:02}.json", i), empty_environment())
            .await
            .unwrap();
        AttachmentService::create(
            &store.db,
            store.storage.as_ref(),
            new_attachment(key("urn:shell:many", "urn:sm:docs", &format!("Doc{}", i)), "doc.txt"),
            Bytes::from(format!("document {}", i)),
        )
        .await
        .unwrap();
    }

    let names = PackageService::list_file_names(&store.db, None, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(names.total_count, 25);
    assert_eq!(names.items.len(), 25);
    assert_eq!(names.items[24], "env-24.json");

    let metas = AttachmentService::list_all(&store.db, PageQuery::default()).await.unwrap();
    assert_eq!(metas.items.len() as i64, metas.total_count);

    let blobs = BlobService::list(&store.db, PageQuery::default()).await.unwrap();
    assert_eq!(blobs.items.len(), 25);

    // An explicit limit still pages
    let page = PackageService::list_file_names(&store.db, None, PageQuery::new(20, 20))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 5);
}

#[tokio::test]
async fn file_names_filter_by_kind() {
    let store = TestStore::new(GcMode::Eager).await;
    PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        store.max_unpacked_bytes(),
    )
    .await
    .unwrap();
    PackageService::ingest_json(&store.db, BASE_URL, "plain.json", empty_environment())
        .await
        .unwrap();

    let json = PackageService::list_file_names(&store.db, Some(PackageKind::Json), PageQuery::default())
        .await
        .unwrap();
    assert_eq!(json.items, vec!["plain.json".to_string()]);
    assert_eq!(json.total_count, 1);

    let aasx = PackageService::list_file_names(&store.db, Some(PackageKind::Aasx), PageQuery::default())
        .await
        .unwrap();
    assert_eq!(aasx.items, vec!["pump.aasx".to_string()]);

    let all = PackageService::list_file_names(&store.db, None, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(all.total_count, 2);
}

#[tokio::test]
async fn oversized_package_is_rejected_without_side_effects() {
    let store = TestStore::new(GcMode::Eager).await;
    let err = PackageService::ingest_aasx(
        &store.db,
        store.storage.as_ref(),
        BASE_URL,
        "pump.aasx",
        common::pump_aasx(),
        64,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let names = PackageService::list_file_names(&store.db, None, PageQuery::default())
        .await
        .unwrap();
    assert_eq!(names.total_count, 0);
    assert!(BlobService::list(&store.db, PageQuery::default()).await.unwrap().items.is_empty());
}
