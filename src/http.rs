//! `ureq`-backed adapter implementing the remote platform seams.
//!
//! Expected 404s (and per-resource 400/422 rejections) are demoted to "no
//! data"; an authorization failure and any other transport error propagate
//! to the caller.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use ureq::Agent;

use crate::remote::{
    AccountDetail, CustomField, DataClient, PeriodPair, RunClient, TemplateInstance,
};

/// Connection settings for one company on the platform.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
    pub company_id: u64,
}

impl RemoteConfig {
    /// Read the configuration from `HARNESS_API_URL`, `HARNESS_API_TOKEN`
    /// and `HARNESS_COMPANY_ID`.
    pub fn from_env() -> Result<Self> {
        let base_url = require_var("HARNESS_API_URL")?;
        let token = require_var("HARNESS_API_TOKEN")?;
        let company_id = require_var("HARNESS_COMPANY_ID")?
            .parse()
            .context("parse HARNESS_COMPANY_ID")?;
        Ok(RemoteConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            company_id,
        })
    }
}

fn require_var(name: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow!("{name} is not set"))
}

/// HTTP client for company data and run execution.
pub struct HttpRemote {
    agent: Agent,
    config: RemoteConfig,
    auth_header: String,
}

impl HttpRemote {
    pub fn new(config: RemoteConfig) -> Self {
        let auth_header = format!("Bearer {}", config.token);
        HttpRemote {
            agent: Agent::new_with_defaults(),
            config,
            auth_header,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!(
            "{}/companies/{}/{path_and_query}",
            self.config.base_url, self.config.company_id
        )
    }

    fn get_json(&self, path_and_query: &str) -> Result<Option<Value>> {
        let url = self.url(path_and_query);
        let result = self
            .agent
            .get(url.as_str())
            .header("Authorization", self.auth_header.as_str())
            .call();
        match result {
            Ok(mut response) => {
                let value = response
                    .body_mut()
                    .read_json()
                    .with_context(|| format!("decode response of {url}"))?;
                Ok(Some(value))
            }
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(ureq::Error::StatusCode(code @ (400 | 422))) => {
                tracing::warn!(code, url = %url, "request rejected, treating as no data");
                Ok(None)
            }
            Err(ureq::Error::StatusCode(403)) => Err(anyhow!("not authorized for {url}")),
            Err(err) => Err(err).with_context(|| format!("request {url}")),
        }
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        let mut response = self
            .agent
            .post(url.as_str())
            .header("Authorization", self.auth_header.as_str())
            .send_json(body)
            .with_context(|| format!("request {url}"))?;
        response
            .body_mut()
            .read_json()
            .with_context(|| format!("decode response of {url}"))
    }
}

impl DataClient for HttpRemote {
    fn current_and_previous_period(&self, template_id: u64) -> Result<PeriodPair> {
        let value = self
            .get_json(&format!("templates/{template_id}/periods/current"))?
            .ok_or_else(|| anyhow!("template {template_id} has no current period"))?;
        serde_json::from_value(value).context("decode period pair")
    }

    fn template_results(
        &self,
        template_id: u64,
        period_id: &str,
    ) -> Result<BTreeMap<String, Value>> {
        match self.get_json(&format!("templates/{template_id}/results?period={period_id}"))? {
            Some(value) => serde_json::from_value(value).context("decode template results"),
            None => Ok(BTreeMap::new()),
        }
    }

    fn template_custom_fields(
        &self,
        template_id: u64,
        period_id: &str,
    ) -> Result<Vec<CustomField>> {
        match self.get_json(&format!(
            "templates/{template_id}/custom_fields?period={period_id}"
        ))? {
            Some(value) => serde_json::from_value(value).context("decode custom fields"),
            None => Ok(Vec::new()),
        }
    }

    fn company_fields(&self, period_id: &str) -> Result<BTreeMap<String, Value>> {
        match self.get_json(&format!("company?period={period_id}"))? {
            Some(value) => serde_json::from_value(value).context("decode company fields"),
            None => Ok(BTreeMap::new()),
        }
    }

    fn company_custom_fields(&self, period_id: &str) -> Result<Vec<CustomField>> {
        match self.get_json(&format!("company/custom_fields?period={period_id}"))? {
            Some(value) => serde_json::from_value(value).context("decode company custom fields"),
            None => Ok(Vec::new()),
        }
    }

    fn account_details(&self, number: &str, period_id: &str) -> Result<Option<AccountDetail>> {
        match self.get_json(&format!("accounts/{number}?period={period_id}"))? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).context("decode account details")?,
            )),
            None => Ok(None),
        }
    }

    fn find_template(&self, handle: &str) -> Result<Option<TemplateInstance>> {
        let Some(value) = self.get_json(&format!("templates?handle={handle}"))? else {
            return Ok(None);
        };
        let mut instances: Vec<TemplateInstance> =
            serde_json::from_value(value).context("decode template lookup")?;
        if instances.len() > 1 {
            tracing::warn!(handle, count = instances.len(), "handle matches several templates, using the first");
        }
        Ok(if instances.is_empty() {
            None
        } else {
            Some(instances.remove(0))
        })
    }
}

impl RunClient for HttpRemote {
    fn submit_test_run(&self, payload: &Value) -> Result<u64> {
        let response = self.post_json("test_runs", payload)?;
        run_id_from(&response)
    }

    fn submit_preview_run(&self, payload: &Value) -> Result<u64> {
        let response = self.post_json("preview_runs", payload)?;
        run_id_from(&response)
    }

    fn poll_run(&self, run_id: u64) -> Result<Value> {
        self.get_json(&format!("test_runs/{run_id}"))?
            .ok_or_else(|| anyhow!("run {run_id} not found"))
    }
}

fn run_id_from(response: &Value) -> Result<u64> {
    response
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("run submission response carries no id"))
}
