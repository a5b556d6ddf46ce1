#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

use aasx_store::config::{Config, GcMode};
use aasx_store::db::Database;
use aasx_store::models::{CompositeKey, NewAttachment};
use aasx_store::storage::{LocalStorage, StorageProvider};
use aasx_store::AppState;

pub const BASE_URL: &str = "http://localhost:8080";

/// Store backed by a throwaway directory; dropped together with it
pub struct TestStore {
    _dir: TempDir,
    pub config: Arc<Config>,
    pub db: Database,
    pub storage: Arc<dyn StorageProvider>,
}

impl TestStore {
    pub async fn new(gc_mode: GcMode) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");

        let mut config = Config::default();
        config.database.path = dir.path().join("store.db").to_string_lossy().into_owned();
        config.storage.local_path = dir.path().join("blobs").to_string_lossy().into_owned();
        config.download.base_url = BASE_URL.to_string();
        config.gc.mode = gc_mode;

        let db = Database::new(&config.database).await.expect("database");
        db.run_migrations().await.expect("migrations");
        let storage: Arc<dyn StorageProvider> = Arc::new(LocalStorage::new(&config.storage));

        Self {
            _dir: dir,
            config: Arc::new(config),
            db,
            storage,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            storage: self.storage.clone(),
        }
    }

    pub fn gc_mode(&self) -> GcMode {
        self.config.gc.mode
    }

    pub fn max_unpacked_bytes(&self) -> u64 {
        self.config.upload.max_unpacked_bytes
    }
}

pub fn key(package_id: &str, sub_container_id: &str, local_element_id: &str) -> CompositeKey {
    CompositeKey::new(package_id, sub_container_id, local_element_id).expect("valid key")
}

pub fn new_attachment(key: CompositeKey, file_name: &str) -> NewAttachment {
    let (name, extension) = NewAttachment::split_file_name(file_name);
    NewAttachment {
        key,
        name,
        extension,
        content_type: "application/pdf".to_string(),
        package_file: None,
    }
}

pub const PUMP_ENV: &str = r#"{
    "assetAdministrationShells": [
        {
            "id": "urn:shell:pump",
            "assetInformation": {
                "assetKind": "Instance",
                "globalAssetId": "urn:asset:pump",
                "defaultThumbnail": { "path": "/aasx/thumbnail.png", "contentType": "image/png" }
            },
            "submodels": [ { "type": "ModelReference", "keys": [ { "type": "Submodel", "value": "urn:sm:docs" } ] } ]
        }
    ],
    "submodels": [
        {
            "id": "urn:sm:docs",
            "idShort": "Documentation",
            "submodelElements": [
                { "modelType": "File", "idShort": "Manual", "value": "/aasx/files/manual.pdf", "contentType": "application/pdf" },
                {
                    "modelType": "SubmodelElementCollection",
                    "idShort": "Certificates",
                    "value": [
                        { "modelType": "File", "idShort": "CE", "value": "/aasx/files/manual.pdf", "contentType": "application/pdf" }
                    ]
                },
                { "modelType": "File", "idShort": "Datasheet", "value": "https://example.com/pump.pdf" }
            ]
        }
    ]
}"#;

pub const MANUAL: &[u8] = b"%PDF-1.7 pump manual";
pub const THUMBNAIL: &[u8] = b"\x89PNG thumbnail";

/// AASX container with a JSON environment, one manual referenced twice and a thumbnail
pub fn pump_aasx() -> Bytes {
    build_aasx(&[
        ("[Content_Types].xml", b"<Types/>"),
        ("_rels/.rels", b"<Relationships/>"),
        ("aasx/aasx-origin", b""),
        ("aasx/env.json", PUMP_ENV.as_bytes()),
        ("aasx/files/manual.pdf", MANUAL),
        ("aasx/thumbnail.png", THUMBNAIL),
    ])
}

pub fn build_aasx(parts: &[(&str, &[u8])]) -> Bytes {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in parts {
        writer
            .start_file(*name, FileOptions::default())
            .expect("start zip entry");
        writer.write_all(data).expect("write zip entry");
    }
    Bytes::from(writer.finish().expect("finish zip").into_inner())
}
