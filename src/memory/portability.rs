//! Portable memory bundles for migration between instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MemoryError, MemoryItem, MemoryStore};
use crate::types::TaintLevel;

/// Bump when the `MemoryItem` schema changes — import rejects
/// incompatible majors.
pub const SCHEMA_VERSION: &str = "1.0";

/// Export cap; real FTS/vector filtering isn't needed for portability.
const EXPORT_LIMIT: usize = 10_000;

/// Bundle provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub exported_at: DateTime<Utc>,
    pub source_instance_id: String,
    pub schema_version: String,
    pub item_count: usize,
}

/// A portable memory bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBundle {
    pub metadata: BundleMetadata,
    pub items: Vec<MemoryItem>,
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported_count: usize,
    pub skipped_count: usize,
    pub conflict_count: usize,
    pub errors: Vec<String>,
}

/// Conflict strategy when an imported id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Keep the existing item.
    Skip,
    /// Replace with the imported item.
    Overwrite,
    /// Keep whichever was updated more recently.
    Merge,
}

/// Optional export filters.
#[derive(Debug, Clone, Default)]
pub struct ExportFilters {
    pub taint: Option<TaintLevel>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

/// Export/import wrapper over a [`MemoryStore`].
pub struct Portability<'a> {
    store: &'a MemoryStore,
    instance_id: String,
}

impl<'a> Portability<'a> {
    /// Bind to a store, stamping exports with `instance_id`.
    pub fn new(store: &'a MemoryStore, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    /// Serialize matching memories into a portable JSON blob.
    pub async fn export_bundle(
        &self,
        since: Option<DateTime<Utc>>,
        filters: &ExportFilters,
    ) -> Result<Vec<u8>, MemoryError> {
        let mut items = self.store.list_recent(EXPORT_LIMIT).await?;

        if let Some(since) = since {
            items.retain(|i| i.updated_at >= since);
        }
        if let Some(taint) = filters.taint {
            items.retain(|i| i.taint == taint);
        }
        if let Some(from) = filters.date_from {
            items.retain(|i| i.created_at >= from);
        }
        if let Some(until) = filters.date_until {
            items.retain(|i| i.created_at <= until);
        }
        if !filters.tags.is_empty() {
            items.retain(|i| i.semantic_tags.iter().any(|t| filters.tags.contains(t)));
        }

        // Stable ordering so byte-level comparisons are meaningful.
        items.sort_by(|a, b| a.memory_id.cmp(&b.memory_id));

        let bundle = MemoryBundle {
            metadata: BundleMetadata {
                exported_at: Utc::now(),
                source_instance_id: self.instance_id.clone(),
                schema_version: SCHEMA_VERSION.to_owned(),
                item_count: items.len(),
            },
            items,
        };
        Ok(serde_json::to_vec_pretty(&bundle)?)
    }

    /// Deserialize a bundle and upsert into the backing store.
    pub async fn import_bundle(
        &self,
        bundle: &[u8],
        mode: ImportMode,
    ) -> Result<ImportResult, MemoryError> {
        let parsed: MemoryBundle = serde_json::from_slice(bundle)?;
        validate_schema_version(&parsed.metadata.schema_version)?;

        let mut result = ImportResult::default();
        for item in &parsed.items {
            let existing = self.store.get(&item.memory_id).await?;

            let Some(existing) = existing else {
                self.store.store(item).await?;
                result.imported_count = result.imported_count.saturating_add(1);
                continue;
            };

            result.conflict_count = result.conflict_count.saturating_add(1);
            match mode {
                ImportMode::Skip => {
                    result.skipped_count = result.skipped_count.saturating_add(1);
                }
                ImportMode::Overwrite => {
                    self.store.store(item).await?;
                    result.imported_count = result.imported_count.saturating_add(1);
                }
                ImportMode::Merge => {
                    if item.updated_at > existing.updated_at {
                        self.store.store(item).await?;
                        result.imported_count = result.imported_count.saturating_add(1);
                    } else {
                        result.skipped_count = result.skipped_count.saturating_add(1);
                    }
                }
            }
        }
        Ok(result)
    }
}

/// Reject bundles from incompatible major versions.
fn validate_schema_version(version: &str) -> Result<(), MemoryError> {
    let major = version.split('.').next().unwrap_or("");
    let current_major = SCHEMA_VERSION.split('.').next().unwrap_or("");
    if major != current_major {
        return Err(MemoryError::IncompatibleBundle(format!(
            "schema version {version} (current: {SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;
    use crate::persistence::open_in_memory;

    async fn store() -> MemoryStore {
        let pool = open_in_memory().await.expect("pool");
        let store = MemoryStore::new(pool);
        store.initialize().await.expect("initialize");
        store
    }

    fn item(id: &str, content: &str) -> MemoryItem {
        MemoryItem::new(id, content, MemoryType::Fact, "test")
    }

    #[tokio::test]
    async fn test_export_import_roundtrip_is_stable() {
        let source = store().await;
        source.store(&item("m1", "alpha")).await.expect("store");
        source.store(&item("m2", "beta")).await.expect("store");

        let porter = Portability::new(&source, "instance-a");
        let bundle = porter
            .export_bundle(None, &ExportFilters::default())
            .await
            .expect("export");

        let target = store().await;
        let target_porter = Portability::new(&target, "instance-b");
        let result = target_porter
            .import_bundle(&bundle, ImportMode::Overwrite)
            .await
            .expect("import");
        assert_eq!(result.imported_count, 2);

        // Re-export and compare item payloads (metadata timestamp differs).
        let second = target_porter
            .export_bundle(None, &ExportFilters::default())
            .await
            .expect("export");
        let a: MemoryBundle = serde_json::from_slice(&bundle).expect("parse");
        let b: MemoryBundle = serde_json::from_slice(&second).expect("parse");
        assert_eq!(
            serde_json::to_value(&a.items).expect("value"),
            serde_json::to_value(&b.items).expect("value"),
        );
    }

    #[tokio::test]
    async fn test_import_skip_keeps_existing() {
        let source = store().await;
        source.store(&item("m1", "from source")).await.expect("store");
        let bundle = Portability::new(&source, "a")
            .export_bundle(None, &ExportFilters::default())
            .await
            .expect("export");

        let target = store().await;
        target.store(&item("m1", "already here")).await.expect("store");
        let result = Portability::new(&target, "b")
            .import_bundle(&bundle, ImportMode::Skip)
            .await
            .expect("import");
        assert_eq!(result.conflict_count, 1);
        assert_eq!(result.skipped_count, 1);
        let kept = target.get("m1").await.expect("get").expect("present");
        assert_eq!(kept.content, "already here");
    }

    #[tokio::test]
    async fn test_import_merge_prefers_newer() {
        let source = store().await;
        let mut newer = item("m1", "newer content");
        newer.updated_at = Utc::now() + chrono::Duration::hours(1);
        source.store(&newer).await.expect("store");
        let bundle = Portability::new(&source, "a")
            .export_bundle(None, &ExportFilters::default())
            .await
            .expect("export");

        let target = store().await;
        target.store(&item("m1", "older content")).await.expect("store");
        let result = Portability::new(&target, "b")
            .import_bundle(&bundle, ImportMode::Merge)
            .await
            .expect("import");
        assert_eq!(result.imported_count, 1);
        let kept = target.get("m1").await.expect("get").expect("present");
        assert_eq!(kept.content, "newer content");
    }

    #[tokio::test]
    async fn test_incompatible_schema_rejected() {
        let target = store().await;
        let porter = Portability::new(&target, "b");
        let bundle = serde_json::json!({
            "metadata": {
                "exported_at": Utc::now(),
                "source_instance_id": "x",
                "schema_version": "2.0",
                "item_count": 0,
            },
            "items": [],
        });
        let bytes = serde_json::to_vec(&bundle).expect("serialize");
        assert!(matches!(
            porter.import_bundle(&bytes, ImportMode::Skip).await,
            Err(MemoryError::IncompatibleBundle(_))
        ));
    }

    #[tokio::test]
    async fn test_export_filters_by_taint_and_tags() {
        let source = store().await;
        let mut tagged = item("m1", "tagged");
        tagged.semantic_tags = vec!["keep".to_owned()];
        source.store(&tagged).await.expect("store");
        source.store(&item("m2", "untagged")).await.expect("store");

        let filters = ExportFilters {
            tags: vec!["keep".to_owned()],
            ..ExportFilters::default()
        };
        let bundle = Portability::new(&source, "a")
            .export_bundle(None, &filters)
            .await
            .expect("export");
        let parsed: MemoryBundle = serde_json::from_slice(&bundle).expect("parse");
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].memory_id, "m1");
    }
}
