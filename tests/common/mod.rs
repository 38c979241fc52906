//! Shared in-memory collaborators for integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};

use template_harness::remote::{
    AccountDetail, CustomField, DataClient, PeriodPair, RunClient, TemplateInstance,
};
use template_harness::store::{TemplateSource, TemplateStore};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// In-memory [`TemplateStore`]. Fixture writes are recorded, not persisted
/// to disk; the canonical fixture per handle is what `fixtures` holds.
#[derive(Default)]
pub struct StubStore {
    pub templates: BTreeMap<String, TemplateSource>,
    pub shared_parts: BTreeMap<String, String>,
    pub fixtures: BTreeMap<String, String>,
    pub used_by: BTreeMap<String, Vec<String>>,
    pub part_ids: BTreeMap<String, u64>,
    pub written: Mutex<Vec<(PathBuf, String)>>,
}

impl StubStore {
    pub fn with_template(mut self, handle: &str, main: &str) -> Self {
        self.templates
            .insert(handle.to_string(), TemplateSource::from_single(main));
        self
    }

    pub fn with_fixture(mut self, handle: &str, text: &str) -> Self {
        self.fixtures.insert(handle.to_string(), text.to_string());
        self
    }

    pub fn with_shared_part(mut self, name: &str, text: &str) -> Self {
        self.shared_parts.insert(name.to_string(), text.to_string());
        self
    }
}

impl TemplateStore for StubStore {
    fn read_template_source(&self, handle: &str) -> Result<Option<TemplateSource>> {
        Ok(self.templates.get(handle).cloned())
    }

    fn read_shared_part_source(&self, name: &str) -> Result<Option<String>> {
        Ok(self.shared_parts.get(name).cloned())
    }

    fn read_fixture_text(&self, handle: &str) -> Result<Option<String>> {
        Ok(self.fixtures.get(handle).cloned())
    }

    fn write_fixture_text(&self, handle: &str, text: &str) -> Result<PathBuf> {
        let mut written = self.written.lock().map_err(|_| anyhow!("lock poisoned"))?;
        let suffix = written.len() + 1;
        let path = if suffix == 1 {
            PathBuf::from(format!("{handle}_test.yml"))
        } else {
            PathBuf::from(format!("{handle}_test_{suffix}.yml"))
        };
        written.push((path.clone(), text.to_string()));
        Ok(path)
    }

    fn shared_parts_used_by(&self, handle: &str) -> Result<Vec<String>> {
        Ok(self.used_by.get(handle).cloned().unwrap_or_default())
    }

    fn resolve_shared_part_id(&self, _environment: &str, name: &str) -> Result<Option<u64>> {
        Ok(self.part_ids.get(name).copied())
    }
}

/// In-memory [`DataClient`] serving canned company data.
#[derive(Default)]
pub struct StubData {
    pub instances: BTreeMap<String, TemplateInstance>,
    pub periods: BTreeMap<u64, PeriodPair>,
    pub results: BTreeMap<u64, BTreeMap<String, Value>>,
    pub custom: BTreeMap<u64, Vec<CustomField>>,
    pub company: BTreeMap<String, Value>,
    pub company_custom: Vec<CustomField>,
    pub accounts: BTreeMap<String, AccountDetail>,
}

impl DataClient for StubData {
    fn current_and_previous_period(&self, template_id: u64) -> Result<PeriodPair> {
        self.periods
            .get(&template_id)
            .cloned()
            .ok_or_else(|| anyhow!("no periods for template {template_id}"))
    }

    fn template_results(&self, template_id: u64, _period_id: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self.results.get(&template_id).cloned().unwrap_or_default())
    }

    fn template_custom_fields(&self, template_id: u64, _period_id: &str) -> Result<Vec<CustomField>> {
        Ok(self.custom.get(&template_id).cloned().unwrap_or_default())
    }

    fn company_fields(&self, _period_id: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self.company.clone())
    }

    fn company_custom_fields(&self, _period_id: &str) -> Result<Vec<CustomField>> {
        Ok(self.company_custom.clone())
    }

    fn account_details(&self, number: &str, _period_id: &str) -> Result<Option<AccountDetail>> {
        Ok(self.accounts.get(number).cloned())
    }

    fn find_template(&self, handle: &str) -> Result<Option<TemplateInstance>> {
        Ok(self.instances.get(handle).cloned())
    }
}

/// Scripted [`RunClient`]: each handle gets a queue of poll responses. The
/// last response of a queue repeats, so a terminal state stays terminal and
/// an always-pending script can exercise the timeout path.
#[derive(Default)]
pub struct StubRuns {
    scripts: Mutex<BTreeMap<String, VecDeque<Value>>>,
    assigned: Mutex<BTreeMap<u64, String>>,
    next_id: AtomicU64,
    pub submitted: Mutex<Vec<Value>>,
}

impl StubRuns {
    pub fn with_script(self, handle: &str, responses: Vec<Value>) -> Self {
        {
            let mut scripts = self.scripts.lock().expect("lock scripts");
            scripts.insert(handle.to_string(), responses.into());
        }
        self
    }

    fn assign(&self, payload: &Value) -> Result<u64> {
        let handle = payload
            .get("handle")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("payload carries no handle"))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.assigned
            .lock()
            .map_err(|_| anyhow!("lock poisoned"))?
            .insert(id, handle.to_string());
        Ok(id)
    }
}

impl RunClient for StubRuns {
    fn submit_test_run(&self, payload: &Value) -> Result<u64> {
        self.submitted
            .lock()
            .map_err(|_| anyhow!("lock poisoned"))?
            .push(payload.clone());
        self.assign(payload)
    }

    fn submit_preview_run(&self, payload: &Value) -> Result<u64> {
        self.assign(payload)
    }

    fn poll_run(&self, run_id: u64) -> Result<Value> {
        let assigned = self.assigned.lock().map_err(|_| anyhow!("lock poisoned"))?;
        let handle = assigned
            .get(&run_id)
            .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
        let mut scripts = self.scripts.lock().map_err(|_| anyhow!("lock poisoned"))?;
        let queue = scripts
            .get_mut(handle)
            .ok_or_else(|| anyhow!("no script for '{handle}'"))?;
        match queue.len() {
            0 => Err(anyhow!("script for '{handle}' is exhausted")),
            1 => Ok(queue.front().cloned().unwrap_or(Value::Null)),
            _ => Ok(queue.pop_front().unwrap_or(Value::Null)),
        }
    }
}
