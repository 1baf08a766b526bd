//! Duplicate-annotated catalog export: JSON for people, Parquet for
//! analysis, and a manifest pinning both by SHA-256.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use catrec_core::CatalogEntry;
use catrec_storage::{ReportFile, ReportStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

pub const CATALOG_JSON: &str = "catalog.json";
pub const CATALOG_PARQUET: &str = "snapshots/catalog.parquet";
pub const SNAPSHOT_MANIFEST: &str = "snapshots/manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn manifest_entry(name: &str, path: &str, bytes: &[u8]) -> SnapshotManifestFile {
    SnapshotManifestFile {
        name: name.to_string(),
        path: path.to_string(),
        sha256: ReportStore::sha256_hex(bytes),
        bytes: bytes.len() as u64,
    }
}

pub fn catalog_json(entries: &[CatalogEntry]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(entries).context("serializing catalog export")
}

pub fn catalog_parquet(entries: &[CatalogEntry]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("index", DataType::UInt64, false),
        ArrowField::new("raw_name", DataType::Utf8, false),
        ArrowField::new("normalized_name", DataType::Utf8, false),
        ArrowField::new("locator", DataType::Utf8, false),
        ArrowField::new("size_bytes", DataType::UInt64, false),
        ArrowField::new("is_duplicate", DataType::Boolean, false),
        ArrowField::new("duplicate_of", DataType::UInt64, true),
    ]));

    let indexes = UInt64Array::from(entries.iter().map(|e| e.index as u64).collect::<Vec<_>>());
    let raw_names = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.raw_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let normalized = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.normalized_name()))
            .collect::<Vec<_>>(),
    );
    let locators = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.locator.as_str()))
            .collect::<Vec<_>>(),
    );
    let sizes = UInt64Array::from(entries.iter().map(|e| e.size_bytes).collect::<Vec<_>>());
    let duplicates = BooleanArray::from(entries.iter().map(|e| e.is_duplicate).collect::<Vec<_>>());
    let duplicate_of = UInt64Array::from(
        entries
            .iter()
            .map(|e| e.duplicate_of.map(|i| i as u64))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(indexes),
            Arc::new(raw_names),
            Arc::new(normalized),
            Arc::new(locators),
            Arc::new(sizes),
            Arc::new(duplicates),
            Arc::new(duplicate_of),
        ],
    )
    .context("building catalog record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening catalog parquet writer")?;
    writer.write(&batch).context("writing catalog record batch")?;
    writer.into_inner().context("closing catalog parquet writer")
}

/// `catalog.json`, the Parquet snapshot and its manifest, ready to commit
/// with the rest of a run report.
pub fn catalog_files(entries: &[CatalogEntry]) -> Result<Vec<ReportFile>> {
    let json = catalog_json(entries)?;
    let parquet = catalog_parquet(entries)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("catalog", CATALOG_JSON, &json),
            manifest_entry("catalog_snapshot", CATALOG_PARQUET, &parquet),
        ],
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;

    Ok(vec![
        ReportFile::new(CATALOG_JSON, json),
        ReportFile::new(CATALOG_PARQUET, parquet),
        ReportFile::new(SNAPSHOT_MANIFEST, manifest_bytes),
    ])
}
