//! Seams to the remote platform: company data fetches and run execution.
//!
//! Both traits model the platform as logical operations over the structures
//! the engine consumes. "Absent" outcomes (a handle not present in any
//! workflow, an account with no detail for a period) are `Ok(None)`, never
//! errors, so callers can skip missing dependencies without inspecting
//! error text.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An evaluation period, identified the way the platform keys fixture data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub id: String,
}

/// The template's current period plus the chronologically adjacent earlier
/// one, when the platform knows of one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodPair {
    pub current: Period,
    pub previous: Option<Period>,
}

/// A namespaced custom field value attached to a template or company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomField {
    pub namespace: String,
    pub key: String,
    pub value: Value,
}

/// Account detail for one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDetail {
    pub id: u64,
    pub name: String,
    pub value: f64,
}

/// A template as instantiated in some workflow of the active company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInstance {
    pub id: u64,
    pub handle: String,
    pub starred: bool,
}

/// Which rendered-HTML artifacts a run should produce alongside its
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// Diagnostics only.
    #[default]
    None,
    /// Request the rendered input view.
    Input,
    /// Request the rendered preview document.
    Preview,
    /// Request both artifacts.
    All,
}

impl RenderMode {
    pub(crate) fn wants_input(self) -> bool {
        matches!(self, RenderMode::Input | RenderMode::All)
    }

    pub(crate) fn wants_preview(self) -> bool {
        matches!(self, RenderMode::Preview | RenderMode::All)
    }
}

/// Read access to live company data.
pub trait DataClient {
    /// The current period for a template, plus the adjacent earlier period.
    fn current_and_previous_period(&self, template_id: u64) -> Result<PeriodPair>;

    /// Live computed result values for a template in a period.
    fn template_results(&self, template_id: u64, period_id: &str) -> Result<BTreeMap<String, Value>>;

    /// Custom field values stored on a template in a period.
    fn template_custom_fields(&self, template_id: u64, period_id: &str) -> Result<Vec<CustomField>>;

    /// Standard company attributes visible to templates.
    fn company_fields(&self, period_id: &str) -> Result<BTreeMap<String, Value>>;

    /// Namespaced custom fields stored on the company.
    fn company_custom_fields(&self, period_id: &str) -> Result<Vec<CustomField>>;

    /// Detail for one account number in a period, if the account exists.
    fn account_details(&self, number: &str, period_id: &str) -> Result<Option<AccountDetail>>;

    /// Locate a template by handle across every workflow of the company.
    fn find_template(&self, handle: &str) -> Result<Option<TemplateInstance>>;
}

/// Submission and polling of remote test/preview runs.
///
/// Payloads and poll responses are raw JSON values; the orchestrator owns
/// payload assembly and result normalization.
pub trait RunClient {
    fn submit_test_run(&self, payload: &Value) -> Result<u64>;

    fn submit_preview_run(&self, payload: &Value) -> Result<u64>;

    /// Fetch the current raw state of a run. Never blocks on the run itself.
    fn poll_run(&self, run_id: u64) -> Result<Value>;
}
