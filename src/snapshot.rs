//! Read-only reference data for offline operation.
//!
//! The server sends a denormalized snapshot after an online load or inside a
//! sync response. It is stored whole in the `snapshot` cache slot and only
//! ever replaced as one object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::{OfflineStore, SNAPSHOT_SLOT};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCache {
    #[serde(default)]
    pub branches: Vec<Value>,
    /// Sellable variants; each carries its barcodes.
    #[serde(default)]
    pub variants: Vec<Value>,
    #[serde(default)]
    pub units: Vec<Value>,
    #[serde(default)]
    pub customers: Vec<Value>,
    #[serde(default)]
    pub price_lists: Vec<Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl SnapshotCache {
    /// Last stored snapshot, if any. A snapshot that no longer parses is
    /// reported as absent so the terminal can still start.
    pub fn load(store: &dyn OfflineStore) -> Result<Option<Self>, StoreError> {
        let Some(raw) = store.get_cache(SNAPSHOT_SLOT)? else {
            return Ok(None);
        };
        match serde_json::from_value::<SnapshotCache>(raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(error = %e, "cached snapshot is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    /// Replace the stored snapshot after a successful online load.
    pub fn save(&self, store: &dyn OfflineStore) -> Result<(), StoreError> {
        let mut snapshot = self.clone();
        snapshot.fetched_at.get_or_insert_with(Utc::now);
        store.set_cache(SNAPSHOT_SLOT, &serde_json::to_value(&snapshot)?)?;
        info!(
            branches = snapshot.branches.len(),
            variants = snapshot.variants.len(),
            customers = snapshot.customers.len(),
            "offline snapshot saved"
        );
        Ok(())
    }

    /// Variant whose `barcode` or any entry of `barcodes` equals `code`.
    pub fn find_variant_by_barcode(&self, code: &str) -> Option<&Value> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }
        self.variants.iter().find(|variant| {
            let single = variant
                .get("barcode")
                .and_then(Value::as_str)
                .is_some_and(|b| b.trim() == code);
            let listed = variant
                .get("barcodes")
                .and_then(Value::as_array)
                .is_some_and(|list| {
                    list.iter().any(|b| {
                        b.as_str()
                            .or_else(|| b.get("code").and_then(Value::as_str))
                            .is_some_and(|s| s.trim() == code)
                    })
                });
            single || listed
        })
    }

    pub fn find_customer(&self, id: &str) -> Option<&Value> {
        self.customers
            .iter()
            .find(|c| c.get("id").and_then(Value::as_str) == Some(id))
    }
}
