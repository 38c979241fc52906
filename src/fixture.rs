//! Test fixture synthesis from a template's dependency graph and live
//! company data.
//!
//! A synthesized fixture holds one test case seeded with whatever the
//! template currently depends on: its own status and custom fields, the
//! result/custom values it reads from other templates, referenced company
//! attributes, and referenced account balances. Missing dependencies are
//! skipped with a warning; only the primary template itself is required.

use anyhow::{anyhow, bail, Context, Result};
use serde_yaml::{Mapping, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::remote::{CustomField, DataClient, PeriodPair};
use crate::scan::{self, CompanyFieldReferences, DependencyMap};
use crate::store::{TemplateSource, TemplateStore};

const PERIOD_PLACEHOLDER: &str = "__period__";

/// What `synthesize` produced and where it was persisted.
#[derive(Debug)]
pub struct SynthesisOutcome {
    pub case_name: String,
    pub document: String,
    pub path: PathBuf,
}

/// Build a single-case test fixture for `handle` from live data and persist
/// it through the store.
///
/// The fixture's `expectation.reconciled` starts at `reconciled_default`;
/// the engineer edits expectations afterwards. A missing local source or a
/// handle absent from every workflow is fatal: no partial fixture is
/// meaningful without the primary template. Failures on individual
/// dependencies are logged and skipped.
pub fn synthesize(
    store: &dyn TemplateStore,
    data: &dyn DataClient,
    handle: &str,
    case_name: &str,
    reconciled_default: bool,
) -> Result<SynthesisOutcome> {
    let source = store
        .read_template_source(handle)?
        .ok_or_else(|| anyhow!("template '{handle}' has no local source"))?;
    if source.is_empty() {
        bail!("template '{handle}' has empty source");
    }
    let own = data
        .find_template(handle)?
        .ok_or_else(|| anyhow!("template '{handle}' not found in any workflow"))?;

    let mut case = skeleton_case(reconciled_default);

    let period_pair = data
        .current_and_previous_period(own.id)
        .context("resolve current period")?;
    resolve_period(&mut case, &period_pair);
    let current = period_pair.current.id.clone();

    // Own-template facts for the current period.
    let mut own_customs = data
        .template_custom_fields(own.id, &current)
        .with_context(|| format!("fetch custom fields of '{handle}'"))?;
    sort_custom_fields(&mut own_customs);
    {
        let own_entry = child_map(reconciliations(&mut case, &current), handle);
        own_entry.insert(yaml_str("starred"), Value::Bool(own.starred));
        if !own_customs.is_empty() {
            let custom_map = child_map(own_entry, "custom");
            for field in &own_customs {
                let key = format!("{}.{}", field.namespace, field.key);
                custom_map.insert(yaml_str(&key), json_to_yaml(&field.value)?);
            }
        }
    }

    // Expected results start from the live computed values.
    let own_results = data
        .template_results(own.id, &current)
        .with_context(|| format!("fetch results of '{handle}'"))?;
    {
        let expectation = child_map(&mut case, "expectation");
        let results_map = child_map(expectation, "results");
        for (name, value) in &own_results {
            results_map.insert(yaml_str(name), json_to_yaml(value)?);
        }
    }

    // Dependency discovery over the template and its shared-part closure.
    let scans = scan_with_closure(store, &source, handle)?;

    for (dep_handle, fields) in &scans.result_deps {
        copy_dependency(
            data,
            &mut case,
            &current,
            dep_handle,
            fields,
            DependencySection::Results,
        );
    }
    for (dep_handle, fields) in &scans.custom_deps {
        copy_dependency(
            data,
            &mut case,
            &current,
            dep_handle,
            fields,
            DependencySection::Custom,
        );
    }

    copy_company_fields(data, &mut case, &current, &scans.company_refs);

    // Account enrichment runs over the assembled document's text form so it
    // also picks up literals arriving through copied values.
    let assembled = render_document(handle, case_name, &case)?;
    for number in scan::literal_account_references(&assembled) {
        match data.account_details(&number, &current) {
            Ok(Some(detail)) => {
                let mut entry = Mapping::new();
                entry.insert(yaml_str("id"), Value::Number(detail.id.into()));
                entry.insert(yaml_str("name"), yaml_str(&detail.name));
                entry.insert(yaml_str("value"), Value::Number(detail.value.into()));
                let periods_entry = child_map_path(&mut case, &["data", "periods"]);
                let accounts = child_map(child_map(periods_entry, &current), "accounts");
                accounts.insert(yaml_str(&number), Value::Mapping(entry));
            }
            Ok(None) => tracing::warn!(account = %number, "referenced account not found, skipping"),
            Err(err) => tracing::warn!(account = %number, error = %err, "account fetch failed, skipping"),
        }
    }

    let document = render_document(handle, case_name, &case)?;
    let path = store.write_fixture_text(handle, &document)?;
    tracing::info!(handle, case = case_name, path = %path.display(), "fixture written");

    Ok(SynthesisOutcome {
        case_name: case_name.to_string(),
        document,
        path,
    })
}

/// Everything the dependency scans yield for a template plus its shared-part
/// closure, with self-references already removed.
struct ClosureScans {
    result_deps: DependencyMap,
    custom_deps: DependencyMap,
    company_refs: CompanyFieldReferences,
}

fn scan_with_closure(
    store: &dyn TemplateStore,
    source: &TemplateSource,
    handle: &str,
) -> Result<ClosureScans> {
    let mut result_deps = DependencyMap::new();
    let mut custom_deps = DependencyMap::new();
    scan::cross_template_result_references(source, handle, &mut result_deps);
    scan::cross_template_custom_references(source, handle, &mut custom_deps);
    let mut company_refs = scan::company_field_references(source);

    // Shared parts may include further shared parts; walk the closure
    // without ever scanning a part twice.
    let mut scanned: Vec<String> = Vec::new();
    let mut pending: VecDeque<String> = scan::shared_part_references(source).into();
    while let Some(name) = pending.pop_front() {
        if scanned.contains(&name) {
            continue;
        }
        scanned.push(name.clone());
        let Some(text) = store.read_shared_part_source(&name)? else {
            tracing::warn!(part = %name, "included shared part has no local source");
            continue;
        };
        let part = TemplateSource::from_single(text);
        for nested in scan::shared_part_references(&part) {
            if !scanned.contains(&nested) {
                pending.push_back(nested);
            }
        }
        scan::cross_template_result_references(&part, handle, &mut result_deps);
        scan::cross_template_custom_references(&part, handle, &mut custom_deps);
        merge_company_refs(&mut company_refs, scan::company_field_references(&part));
    }

    // A part's reference back to the including template is not a dependency.
    result_deps.remove(handle);
    custom_deps.remove(handle);

    Ok(ClosureScans {
        result_deps,
        custom_deps,
        company_refs,
    })
}

fn merge_company_refs(into: &mut CompanyFieldReferences, from: CompanyFieldReferences) {
    for field in from.standard {
        if !into.standard.contains(&field) {
            into.standard.push(field);
        }
    }
    for field in from.custom {
        if !into.custom.contains(&field) {
            into.custom.push(field);
        }
    }
}

#[derive(Clone, Copy)]
enum DependencySection {
    Results,
    Custom,
}

impl DependencySection {
    fn key(self) -> &'static str {
        match self {
            DependencySection::Results => "results",
            DependencySection::Custom => "custom",
        }
    }
}

fn copy_dependency(
    data: &dyn DataClient,
    case: &mut Mapping,
    period: &str,
    dep_handle: &str,
    fields: &std::collections::BTreeSet<String>,
    section: DependencySection,
) {
    let instance = match data.find_template(dep_handle) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            tracing::warn!(dependency = dep_handle, "template not found in any workflow, skipping");
            return;
        }
        Err(err) => {
            tracing::warn!(dependency = dep_handle, error = %err, "template lookup failed, skipping");
            return;
        }
    };

    let live = match section {
        DependencySection::Results => data.template_results(instance.id, period),
        DependencySection::Custom => data
            .template_custom_fields(instance.id, period)
            .map(custom_fields_by_key),
    };
    let live = match live {
        Ok(live) => live,
        Err(err) => {
            tracing::warn!(dependency = dep_handle, error = %err, "data fetch failed, skipping");
            return;
        }
    };

    let mut copied = Mapping::new();
    for field in fields {
        match live.get(field) {
            Some(value) => match json_to_yaml(value) {
                Ok(value) => {
                    copied.insert(yaml_str(field), value);
                }
                Err(err) => tracing::warn!(dependency = dep_handle, field = %field, error = %err, "value not representable, skipping"),
            },
            None => tracing::debug!(dependency = dep_handle, field = %field, "no live value"),
        }
    }
    if copied.is_empty() {
        return;
    }
    let dep_entry = child_map(reconciliations(case, period), dep_handle);
    dep_entry.insert(yaml_str(section.key()), Value::Mapping(copied));
}

fn custom_fields_by_key(fields: Vec<CustomField>) -> std::collections::BTreeMap<String, serde_json::Value> {
    fields
        .into_iter()
        .map(|field| (format!("{}.{}", field.namespace, field.key), field.value))
        .collect()
}

fn copy_company_fields(
    data: &dyn DataClient,
    case: &mut Mapping,
    period: &str,
    refs: &CompanyFieldReferences,
) {
    if refs.standard.is_empty() && refs.custom.is_empty() {
        return;
    }

    let mut company = Mapping::new();
    if !refs.standard.is_empty() {
        match data.company_fields(period) {
            Ok(fields) => {
                for name in &refs.standard {
                    if let Some(value) = fields.get(name) {
                        match json_to_yaml(value) {
                            Ok(value) => {
                                company.insert(yaml_str(name), value);
                            }
                            Err(err) => tracing::warn!(field = %name, error = %err, "value not representable, skipping"),
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "company data fetch failed, skipping"),
        }
    }
    if !refs.custom.is_empty() {
        match data.company_custom_fields(period) {
            Ok(fields) => {
                let by_key = custom_fields_by_key(fields);
                let mut custom = Mapping::new();
                for name in &refs.custom {
                    if let Some(value) = by_key.get(name) {
                        match json_to_yaml(value) {
                            Ok(value) => {
                                custom.insert(yaml_str(name), value);
                            }
                            Err(err) => tracing::warn!(field = %name, error = %err, "value not representable, skipping"),
                        }
                    }
                }
                if !custom.is_empty() {
                    company.insert(yaml_str("custom"), Value::Mapping(custom));
                }
            }
            Err(err) => tracing::warn!(error = %err, "company custom field fetch failed, skipping"),
        }
    }

    if !company.is_empty() {
        let data_map = child_map(case, "data");
        data_map.insert(yaml_str("company"), Value::Mapping(company));
    }
}

/// A fresh case with the period still a placeholder: empty current period
/// data, default expectation, empty result/rollforward expectations.
fn skeleton_case(reconciled_default: bool) -> Mapping {
    let mut case = Mapping::new();

    let mut context = Mapping::new();
    context.insert(yaml_str("period"), yaml_str(PERIOD_PLACEHOLDER));
    case.insert(yaml_str("context"), Value::Mapping(context));

    let mut periods = Mapping::new();
    periods.insert(yaml_str(PERIOD_PLACEHOLDER), Value::Mapping(Mapping::new()));
    let mut data_map = Mapping::new();
    data_map.insert(yaml_str("periods"), Value::Mapping(periods));
    case.insert(yaml_str("data"), Value::Mapping(data_map));

    let mut expectation = Mapping::new();
    expectation.insert(yaml_str("reconciled"), Value::Bool(reconciled_default));
    expectation.insert(yaml_str("results"), Value::Mapping(Mapping::new()));
    expectation.insert(yaml_str("rollforwards"), Value::Mapping(Mapping::new()));
    case.insert(yaml_str("expectation"), Value::Mapping(expectation));

    case
}

/// Replace the placeholder period key with the resolved current period, and
/// record the adjacent earlier period as `null` data when it exists under a
/// distinct identifier.
fn resolve_period(case: &mut Mapping, pair: &PeriodPair) {
    let current = pair.current.id.as_str();
    {
        let periods = child_map_path(case, &["data", "periods"]);
        periods.remove(yaml_str(PERIOD_PLACEHOLDER));
        if let Some(previous) = &pair.previous {
            if previous.id != current {
                periods.insert(yaml_str(&previous.id), Value::Null);
            }
        }
        periods.insert(yaml_str(current), Value::Mapping(Mapping::new()));
    }
    let context = child_map(case, "context");
    context.insert(yaml_str("period"), yaml_str(current));
}

fn reconciliations<'a>(case: &'a mut Mapping, period: &str) -> &'a mut Mapping {
    let periods = child_map_path(case, &["data", "periods"]);
    let current = child_map(periods, period);
    child_map(current, "reconciliations")
}

fn render_document(handle: &str, case_name: &str, case: &Mapping) -> Result<String> {
    let mut doc = Mapping::new();
    doc.insert(yaml_str(case_name), Value::Mapping(case.clone()));
    let body =
        serde_yaml::to_string(&Value::Mapping(doc)).context("serialize fixture document")?;
    Ok(format!(
        "# Test fixture for '{handle}', seeded from live company data.\n{body}"
    ))
}

/// Sort custom fields by namespace, then by key with numeric-suffix-aware
/// ordering (`item_2` before `item_10`).
fn sort_custom_fields(fields: &mut [CustomField]) {
    fields.sort_by(|a, b| {
        a.namespace
            .cmp(&b.namespace)
            .then_with(|| natural_cmp(&a.key, &b.key))
    });
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a_stem, a_num) = split_numeric_suffix(a);
    let (b_stem, b_num) = split_numeric_suffix(b);
    if a_stem == b_stem {
        match (a_num, b_num) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    } else {
        a.cmp(b)
    }
}

fn split_numeric_suffix(text: &str) -> (&str, Option<u64>) {
    let digits = text
        .bytes()
        .rev()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    if digits == 0 {
        return (text, None);
    }
    let split = text.len() - digits;
    match text[split..].parse() {
        Ok(number) => (&text[..split], Some(number)),
        Err(_) => (text, None),
    }
}

fn yaml_str(text: &str) -> Value {
    Value::String(text.to_string())
}

fn json_to_yaml(value: &serde_json::Value) -> Result<Value> {
    serde_yaml::to_value(value).context("convert value to fixture form")
}

fn child_map<'a>(parent: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let entry = parent
        .entry(yaml_str(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !matches!(entry, Value::Mapping(_)) {
        *entry = Value::Mapping(Mapping::new());
    }
    match entry {
        Value::Mapping(map) => map,
        _ => unreachable!("entry was just set to a mapping"),
    }
}

fn child_map_path<'a>(parent: &'a mut Mapping, path: &[&str]) -> &'a mut Mapping {
    let mut current = parent;
    for key in path {
        current = child_map(current, key);
    }
    current
}
