//! Run orchestration: payload assembly, submission, polling, result
//! normalization, and reporting.
//!
//! Per run the flow is strictly sequential: submit, then poll with a
//! growing delay until a terminal state or the wall-clock budget runs out.
//! Batch status mode fans out one independent run per handle; a handle's
//! timeout or failure never stops its siblings.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use crate::index;
use crate::remote::{RenderMode, RunClient};
use crate::store::TemplateStore;

/// A template bundle plus the fixture text to evaluate remotely.
#[derive(Debug, Clone, Serialize)]
pub struct RunPayload {
    pub handle: String,
    pub template_text: String,
    pub part_texts: BTreeMap<String, String>,
    pub shared_part_ids: Vec<u64>,
    pub fixture_text: String,
    /// 1-based line of a single case the engine may short-circuit to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_line: Option<usize>,
    pub html_input: bool,
    pub html_preview: bool,
}

/// A payload plus the per-case line deltas needed to report diagnostics
/// against the original fixture file.
#[derive(Debug)]
pub struct BuiltPayload {
    pub payload: RunPayload,
    pub line_adjustments: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    TestError,
    InternalError,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::TestError | RunStatus::InternalError
        )
    }
}

/// One expectation mismatch reported by the remote engine.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub got: Value,
    pub expected: Value,
    /// Line in the submitted fixture text, when the engine attributes one.
    pub line_number: Option<usize>,
}

/// Diagnostics for one test case. An empty result is a pass.
#[derive(Debug, Clone, Default)]
pub struct CaseResult {
    pub reconciled: Option<Diagnostic>,
    pub results: BTreeMap<String, Diagnostic>,
    pub rollforwards: BTreeMap<String, Diagnostic>,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.reconciled.is_none() && self.results.is_empty() && self.rollforwards.is_empty()
    }
}

/// Normalized terminal (or last observed) state of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub per_case: BTreeMap<String, CaseResult>,
    pub error_message: Option<String>,
}

/// Client-side polling schedule: the delay starts at `initial_delay`, grows
/// by `backoff_factor` each iteration, and polling gives up once
/// `max_wait` of wall-clock time has elapsed.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_wait: Duration::from_secs(180),
        }
    }
}

/// Shared selection and pacing options for one orchestration request.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Environment whose shared-part ids are bundled into payloads.
    pub environment: &'a str,
    /// Run a single named case when non-empty.
    pub case_name: &'a str,
    /// Narrow the fixture to cases whose names contain this substring.
    pub pattern: &'a str,
    pub render: RenderMode,
    pub policy: &'a PollPolicy,
}

/// Assemble the run payload for a template.
///
/// Returns `Ok(None)` when the fixture holds no cases (or does not exist),
/// a normal "nothing to run" outcome. A `pattern` matching no case is a
/// user error and fails instead. When `case_name` is given, its indexed
/// line in the submitted text is set as `test_line`.
pub fn build_run_payload(
    store: &dyn TemplateStore,
    handle: &str,
    options: &RunOptions<'_>,
) -> Result<Option<BuiltPayload>> {
    let source = store
        .read_template_source(handle)?
        .ok_or_else(|| anyhow!("template '{handle}' has no local source"))?;
    let Some(fixture) = store.read_fixture_text(handle)? else {
        tracing::info!(handle, "no test fixture, nothing to run");
        return Ok(None);
    };
    let full_index = index::index_case_lines(&fixture)?;
    if full_index.is_empty() {
        tracing::info!(handle, "fixture has no test cases, nothing to run");
        return Ok(None);
    }

    let (fixture_text, line_adjustments) = if options.pattern.is_empty() {
        (fixture, BTreeMap::new())
    } else {
        let filtered = index::filter_by_pattern(&fixture, options.pattern)?;
        if filtered.included.is_empty() {
            bail!(
                "pattern '{}' matches no test case of '{handle}'",
                options.pattern
            );
        }
        (filtered.text, filtered.line_adjustments)
    };

    let test_line = if options.case_name.is_empty() {
        None
    } else {
        let submitted_index = index::index_case_lines(&fixture_text)?;
        let line = submitted_index.get(options.case_name).copied().ok_or_else(|| {
            anyhow!(
                "test case '{}' not found in fixture of '{handle}'",
                options.case_name
            )
        })?;
        Some(line)
    };

    let mut shared_part_ids = Vec::new();
    for name in store.shared_parts_used_by(handle)? {
        match store.resolve_shared_part_id(options.environment, &name)? {
            Some(id) => shared_part_ids.push(id),
            None => tracing::warn!(
                part = %name,
                environment = options.environment,
                "shared part has no id in environment, not bundled"
            ),
        }
    }

    let payload = RunPayload {
        handle: handle.to_string(),
        template_text: source.main,
        part_texts: source.parts.into_iter().collect(),
        shared_part_ids,
        fixture_text,
        test_line,
        html_input: options.render.wants_input(),
        html_preview: options.render.wants_preview(),
    };
    Ok(Some(BuiltPayload {
        payload,
        line_adjustments,
    }))
}

/// Submit a test run (plus a preview run when the render mode asks for one)
/// and poll it to a terminal state.
pub fn submit_and_await(
    client: &dyn RunClient,
    payload: &RunPayload,
    render: RenderMode,
    policy: &PollPolicy,
) -> Result<RunResult> {
    let body = serde_json::to_value(payload).context("serialize run payload")?;
    let run_id = client.submit_test_run(&body).context("submit test run")?;
    tracing::info!(handle = %payload.handle, run_id, "test run submitted");
    let result = await_run(client, run_id, policy)?;

    if render.wants_preview() {
        let preview_id = client
            .submit_preview_run(&body)
            .context("submit preview run")?;
        tracing::debug!(handle = %payload.handle, run_id = preview_id, "preview run submitted");
        await_run(client, preview_id, policy)
            .with_context(|| format!("await preview run {preview_id}"))?;
    }

    Ok(result)
}

fn await_run(client: &dyn RunClient, run_id: u64, policy: &PollPolicy) -> Result<RunResult> {
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    loop {
        thread::sleep(delay);
        let raw = client
            .poll_run(run_id)
            .with_context(|| format!("poll run {run_id}"))?;
        let result = normalize_run_result(&raw)?;
        if result.status.is_terminal() {
            return Ok(result);
        }
        if started.elapsed() >= policy.max_wait {
            bail!(
                "run {run_id} still {:?} after {:.0?}, giving up",
                result.status,
                policy.max_wait
            );
        }
        delay = delay.mul_f64(policy.backoff_factor);
        tracing::debug!(run_id, status = ?result.status, next_delay = ?delay, "run not finished");
    }
}

/// Decode a raw poll response into a [`RunResult`].
///
/// The platform has shipped more than one response shape; both the
/// `status`/`state` key and the `tests`/`result` per-case key are accepted,
/// and diagnostics may be `{got, expected, line_number}` objects or bare
/// `[got, expected]` pairs.
pub fn normalize_run_result(raw: &Value) -> Result<RunResult> {
    let status_text = raw
        .get("status")
        .or_else(|| raw.get("state"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("run response carries no status"))?;
    let status = match status_text {
        "queued" | "pending" | "started" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "test_error" => RunStatus::TestError,
        "internal_error" => RunStatus::InternalError,
        other => bail!("unrecognized run status '{other}'"),
    };

    let error_message = raw
        .get("error_message")
        .or_else(|| raw.get("message"))
        .and_then(Value::as_str)
        .map(String::from);

    let mut per_case = BTreeMap::new();
    if let Some(cases) = raw
        .get("tests")
        .or_else(|| raw.get("result"))
        .and_then(Value::as_object)
    {
        for (name, body) in cases {
            per_case.insert(name.clone(), normalize_case(body));
        }
    }

    Ok(RunResult {
        status,
        per_case,
        error_message,
    })
}

fn normalize_case(body: &Value) -> CaseResult {
    CaseResult {
        reconciled: body.get("reconciled").and_then(normalize_diagnostic),
        results: collect_diagnostics(body.get("results")),
        rollforwards: collect_diagnostics(body.get("rollforwards")),
    }
}

fn collect_diagnostics(section: Option<&Value>) -> BTreeMap<String, Diagnostic> {
    let mut diagnostics = BTreeMap::new();
    if let Some(map) = section.and_then(Value::as_object) {
        for (name, value) in map {
            if let Some(diagnostic) = normalize_diagnostic(value) {
                diagnostics.insert(name.clone(), diagnostic);
            }
        }
    }
    diagnostics
}

fn normalize_diagnostic(value: &Value) -> Option<Diagnostic> {
    match value {
        Value::Object(map) => Some(Diagnostic {
            got: map.get("got").or_else(|| map.get("actual")).cloned().unwrap_or(Value::Null),
            expected: map.get("expected").cloned().unwrap_or(Value::Null),
            line_number: map
                .get("line_number")
                .or_else(|| map.get("line"))
                .and_then(Value::as_u64)
                .map(|line| line as usize),
        }),
        Value::Array(pair) if pair.len() == 2 => Some(Diagnostic {
            got: pair[0].clone(),
            expected: pair[1].clone(),
            line_number: None,
        }),
        _ => None,
    }
}

/// Render the pass/fail report for one run. Diagnostic line numbers are
/// shifted back into the original fixture's coordinates by each case's
/// recorded adjustment (0 when absent).
pub fn render_report(
    result: &RunResult,
    line_adjustments: &BTreeMap<String, i64>,
) -> (bool, String) {
    let mut out = String::new();
    match result.status {
        RunStatus::Completed => {}
        RunStatus::TestError | RunStatus::InternalError => {
            let label = if result.status == RunStatus::TestError {
                "test error"
            } else {
                "internal error"
            };
            let message = result.error_message.as_deref().unwrap_or("no detail provided");
            out.push_str(&format!("{label}: {message}\n"));
            return (false, out);
        }
        RunStatus::Pending | RunStatus::Running => {
            out.push_str("run did not reach a terminal state\n");
            return (false, out);
        }
    }

    let mut failed = 0usize;
    for (name, case) in &result.per_case {
        if case.passed() {
            continue;
        }
        failed += 1;
        let shift = line_adjustments.get(name).copied().unwrap_or(0);
        out.push_str(&format!("case {name}: FAILED\n"));
        if let Some(diagnostic) = &case.reconciled {
            out.push_str(&format!(
                "  reconciled: {}\n",
                format_diagnostic(diagnostic, shift)
            ));
        }
        for (field, diagnostic) in &case.results {
            out.push_str(&format!(
                "  result {field}: {}\n",
                format_diagnostic(diagnostic, shift)
            ));
        }
        for (field, diagnostic) in &case.rollforwards {
            out.push_str(&format!(
                "  rollforward {field}: {}\n",
                format_diagnostic(diagnostic, shift)
            ));
        }
    }

    let total = result.per_case.len();
    if failed == 0 {
        out.push_str(&format!("PASSED: all {total} case(s) passed\n"));
        (true, out)
    } else {
        out.push_str(&format!("FAILED: {failed} of {total} case(s) failed\n"));
        (false, out)
    }
}

/// Print the report for one run and return whether it passed.
pub fn report(result: &RunResult, line_adjustments: &BTreeMap<String, i64>) -> bool {
    let (passed, rendered) = render_report(result, line_adjustments);
    print!("{rendered}");
    passed
}

fn format_diagnostic(diagnostic: &Diagnostic, shift: i64) -> String {
    let mut text = format!(
        "got {}, expected {}",
        render_value(&diagnostic.got),
        render_value(&diagnostic.expected)
    );
    if let Some(line) = diagnostic.line_number {
        text.push_str(&format!(" (line {})", line as i64 + shift));
    }
    text
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Outcome of one handle in batch status mode.
#[derive(Debug)]
pub struct HandleOutcome {
    pub handle: String,
    pub passed: bool,
    pub failing_cases: Vec<String>,
    /// Extra context: an error message, or why there was nothing to run.
    pub detail: Option<String>,
}

/// Aggregated result of batch status mode.
#[derive(Debug)]
pub struct BatchOutcome {
    pub passed: bool,
    pub handles: Vec<HandleOutcome>,
}

impl BatchOutcome {
    /// One line per handle plus a final overall line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for outcome in &self.handles {
            if outcome.passed {
                match &outcome.detail {
                    Some(detail) => out.push_str(&format!("{}: PASSED ({detail})\n", outcome.handle)),
                    None => out.push_str(&format!("{}: PASSED\n", outcome.handle)),
                }
            } else if outcome.failing_cases.is_empty() {
                let detail = outcome.detail.as_deref().unwrap_or("error");
                out.push_str(&format!("{}: FAILED ({detail})\n", outcome.handle));
            } else {
                out.push_str(&format!(
                    "{}: FAILED ({})\n",
                    outcome.handle,
                    outcome.failing_cases.join(", ")
                ));
            }
        }
        out.push_str(if self.passed { "PASSED\n" } else { "FAILED\n" });
        out
    }
}

/// Run every handle's suite concurrently and aggregate pass/fail.
///
/// Each handle gets an independent build + submit + poll pipeline with no
/// shared mutable state; the overall outcome passes only if every handle
/// passed. Individual failures, timeouts included, never abort the batch.
pub fn run_status_only<S, C>(
    store: &S,
    client: &C,
    handles: &[String],
    options: &RunOptions<'_>,
) -> BatchOutcome
where
    S: TemplateStore + Sync,
    C: RunClient + Sync,
{
    let outcomes: Vec<HandleOutcome> = thread::scope(|scope| {
        let tasks: Vec<_> = handles
            .iter()
            .map(|handle| (handle, scope.spawn(move || run_one(store, client, handle, options))))
            .collect();
        tasks
            .into_iter()
            .map(|(handle, task)| match task.join() {
                Ok(outcome) => outcome,
                Err(_) => HandleOutcome {
                    handle: handle.clone(),
                    passed: false,
                    failing_cases: Vec::new(),
                    detail: Some("worker panicked".to_string()),
                },
            })
            .collect()
    });

    let passed = outcomes.iter().all(|outcome| outcome.passed);
    BatchOutcome {
        passed,
        handles: outcomes,
    }
}

fn run_one<S, C>(store: &S, client: &C, handle: &str, options: &RunOptions<'_>) -> HandleOutcome
where
    S: TemplateStore + Sync,
    C: RunClient + Sync,
{
    match try_run_one(store, client, handle, options) {
        Ok(None) => HandleOutcome {
            handle: handle.to_string(),
            passed: true,
            failing_cases: Vec::new(),
            detail: Some("no test cases".to_string()),
        },
        Ok(Some(result)) => {
            if result.status == RunStatus::Completed {
                let failing_cases: Vec<String> = result
                    .per_case
                    .iter()
                    .filter(|(_, case)| !case.passed())
                    .map(|(name, _)| name.clone())
                    .collect();
                HandleOutcome {
                    handle: handle.to_string(),
                    passed: failing_cases.is_empty(),
                    failing_cases,
                    detail: None,
                }
            } else {
                HandleOutcome {
                    handle: handle.to_string(),
                    passed: false,
                    failing_cases: Vec::new(),
                    detail: Some(
                        result
                            .error_message
                            .unwrap_or_else(|| format!("{:?}", result.status)),
                    ),
                }
            }
        }
        Err(err) => HandleOutcome {
            handle: handle.to_string(),
            passed: false,
            failing_cases: Vec::new(),
            detail: Some(format!("{err:#}")),
        },
    }
}

fn try_run_one<S, C>(
    store: &S,
    client: &C,
    handle: &str,
    options: &RunOptions<'_>,
) -> Result<Option<RunResult>>
where
    S: TemplateStore + Sync,
    C: RunClient + Sync,
{
    let Some(built) = build_run_payload(store, handle, options)? else {
        return Ok(None);
    };
    let result = submit_and_await(client, &built.payload, options.render, options.policy)?;
    Ok(Some(result))
}
