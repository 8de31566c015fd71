//! Typed offline actions and their server results.
//!
//! Each offline-eligible operation is a variant of [`OfflineAction`]; the
//! loosely typed `result` the server attaches to an applied action is decoded
//! into the matching [`ActionResult`] variant, keyed by the action type of the
//! local entry it was correlated with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::envelope::{new_id, ActionType};

/// Last provisional receipt stamp handed out (unix ms), keeps numbers strictly
/// increasing within one process even when two sales land in the same ms.
static LAST_PROVISIONAL_RECEIPT_MS: AtomicI64 = AtomicI64::new(0);

/// One cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub variant_id: String,
    pub unit_id: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub method: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTerms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A sale as assembled by the point-of-sale screen, before it is either sent
/// to the server or queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDraft {
    pub branch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_terms: Option<CreditTerms>,
}

impl SaleDraft {
    /// Structural checks only; pricing and stock are validated server-side.
    pub fn validate(&self) -> Result<(), String> {
        if self.branch_id.trim().is_empty() {
            return Err("branchId is required".into());
        }
        if self.lines.is_empty() {
            return Err("a sale needs at least one cart line".into());
        }
        for (i, line) in self.lines.iter().enumerate() {
            if line.variant_id.trim().is_empty() {
                return Err(format!("line {i}: variantId is required"));
            }
            if !line.quantity.is_finite() || line.quantity <= 0.0 {
                return Err(format!("line {i}: quantity must be positive"));
            }
            if !line.unit_price.is_finite() || !line.discount.is_finite() {
                return Err(format!("line {i}: price and discount must be numbers"));
            }
        }
        Ok(())
    }

    /// Cart total for the provisional receipt. The server recomputes the
    /// authoritative amount.
    pub fn provisional_total(&self) -> f64 {
        self.lines
            .iter()
            .map(|l| l.quantity * l.unit_price - l.discount)
            .sum()
    }
}

/// Payload of a `SALE_COMPLETE` action: the draft plus the locally assigned
/// provisional receipt number and the idempotency key the server dedups on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleCompletePayload {
    #[serde(flatten)]
    pub sale: SaleDraft,
    pub local_receipt_number: String,
    pub idempotency_key: String,
}

impl SaleCompletePayload {
    pub fn new(sale: SaleDraft, now: DateTime<Utc>) -> Self {
        Self {
            sale,
            local_receipt_number: provisional_receipt_number(now),
            idempotency_key: new_id(),
        }
    }
}

/// An offline-eligible operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineAction {
    SaleComplete(SaleCompletePayload),
}

impl OfflineAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            OfflineAction::SaleComplete(_) => ActionType::SaleComplete,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            OfflineAction::SaleComplete(p) => serde_json::to_value(p),
        }
    }

    /// Decode a stored payload back into its typed action.
    pub fn from_parts(action_type: ActionType, payload: &Value) -> Result<Self, serde_json::Error> {
        match action_type {
            ActionType::SaleComplete => {
                SaleCompletePayload::deserialize(payload).map(OfflineAction::SaleComplete)
            }
        }
    }
}

/// Result of a completed sale as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleCompleteResult {
    #[serde(default, alias = "receipt_number")]
    pub receipt_number: Option<String>,
    #[serde(default, alias = "sale_id")]
    pub sale_id: Option<String>,
}

/// Typed view of the per-action `result` field of a sync response.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    SaleComplete(SaleCompleteResult),
}

impl ActionResult {
    /// Decode `raw` for an action of type `action_type`. A missing or
    /// unparseable result yields the variant's empty default.
    pub fn decode(action_type: ActionType, raw: Option<&Value>) -> Self {
        match action_type {
            ActionType::SaleComplete => ActionResult::SaleComplete(
                raw.and_then(|v| SaleCompleteResult::deserialize(v).ok())
                    .unwrap_or_default(),
            ),
        }
    }

    pub fn receipt_number(&self) -> Option<&str> {
        match self {
            ActionResult::SaleComplete(r) => r
                .receipt_number
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Provisional receipt number in format `OFF-YYYYMMDD-HHMMSSmmm`, derived
/// from `now` and bumped forward if a number was already issued for that ms.
pub fn provisional_receipt_number(now: DateTime<Utc>) -> String {
    let wanted = now.timestamp_millis();
    let mut last = LAST_PROVISIONAL_RECEIPT_MS.load(Ordering::SeqCst);
    let stamp = loop {
        let next = wanted.max(last + 1);
        match LAST_PROVISIONAL_RECEIPT_MS.compare_exchange(
            last,
            next,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break next,
            Err(current) => last = current,
        }
    };
    let at = DateTime::<Utc>::from_timestamp_millis(stamp).unwrap_or(now);
    format!("OFF-{}", at.format("%Y%m%d-%H%M%S%3f"))
}

/// Local receipt number carried by a sale payload, if any.
pub fn local_receipt_number(payload: &Value) -> Option<String> {
    payload
        .get("localReceiptNumber")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) fn sample_draft() -> SaleDraft {
    SaleDraft {
        branch_id: "branch-1".into(),
        customer_id: Some("cust-1".into()),
        lines: vec![CartLine {
            variant_id: "var-1".into(),
            unit_id: "unit-pcs".into(),
            quantity: 2.0,
            unit_price: 4.5,
            discount: 0.0,
        }],
        payments: vec![Payment {
            method: "cash".into(),
            amount: 9.0,
            reference: None,
        }],
        credit_terms: None,
    }
}

#[cfg(test)]
pub(crate) fn sample_action() -> OfflineAction {
    OfflineAction::SaleComplete(SaleCompletePayload::new(sample_draft(), Utc::now()))
}
