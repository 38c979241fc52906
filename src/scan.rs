//! Regex-based static analysis of template source text.
//!
//! These are lexical matchers, not a template-language parser. Each function
//! documents the exact access shapes it recognizes; anything else (alias
//! chains longer than one assignment, identifiers built dynamically) is not
//! discovered. For the supported shapes the matchers must not produce false
//! positives.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::store::TemplateSource;

/// Cross-template dependencies: handle of the referenced template mapped to
/// the set of field names read from it. A handle key is only ever present
/// with a non-empty set, and accumulation is idempotent.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Company-level field references found in one scan pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompanyFieldReferences {
    /// Bare attributes, `company.<field>`.
    pub standard: Vec<String>,
    /// Namespaced custom fields, `company.custom.<namespace>.<key>`,
    /// recorded as `namespace.key`.
    pub custom: Vec<String>,
}

fn include_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{%-?\s*include\s+["']shared/([A-Za-z0-9_]+)["']"#)
            .expect("include pattern compiles")
    })
}

fn result_access_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"period\.reconciliations\.([A-Za-z0-9_]+)\.results\.([A-Za-z0-9_]+)")
            .expect("result access pattern compiles")
    })
}

fn custom_access_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"period\.reconciliations\.([A-Za-z0-9_]+)\.custom\.([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)")
            .expect("custom access pattern compiles")
    })
}

fn alias_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{%-?\s*assign\s+([A-Za-z0-9_]+)\s*=\s*period\.reconciliations\.([A-Za-z0-9_]+)\s*-?%\}")
            .expect("alias assign pattern compiles")
    })
}

fn company_custom_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"company\.custom\.([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)")
            .expect("company custom pattern compiles")
    })
}

fn company_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bcompany\.([A-Za-z_][A-Za-z0-9_]*)").expect("company field pattern compiles")
    })
}

fn account_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(\d+)").expect("account literal pattern compiles"))
}

/// Shared parts referenced by inclusion markers, `{% include "shared/<name>" %}`,
/// across the main text and every part. Unique, first-seen order.
///
/// This scans one source only; the transitive closure over parts that
/// include further parts is the caller's loop, which must not revisit a
/// part it has already scanned.
pub fn shared_part_references(source: &TemplateSource) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for text in source.texts() {
        for caps in include_re().captures_iter(text) {
            let name = caps[1].to_string();
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
    }
    names
}

/// Cross-template result references, appended into `acc`.
///
/// Recognized shapes:
/// - direct access: `period.reconciliations.<handle>.results.<field>`
/// - one-level alias: `{% assign x = period.reconciliations.<handle> %}`
///   followed anywhere by `x.results.<field>`
///
/// References to `own_handle` are skipped; a part's reference to the
/// template it is included from is not a dependency.
pub fn cross_template_result_references(
    source: &TemplateSource,
    own_handle: &str,
    acc: &mut DependencyMap,
) {
    scan_cross_template(source, own_handle, acc, AccessKind::Results);
}

/// Cross-template custom field references, appended into `acc`. Same two
/// shapes as [`cross_template_result_references`] but for
/// `.custom.<namespace>.<key>` access; fields are recorded as
/// `namespace.key`.
pub fn cross_template_custom_references(
    source: &TemplateSource,
    own_handle: &str,
    acc: &mut DependencyMap,
) {
    scan_cross_template(source, own_handle, acc, AccessKind::Custom);
}

#[derive(Clone, Copy)]
enum AccessKind {
    Results,
    Custom,
}

fn scan_cross_template(
    source: &TemplateSource,
    own_handle: &str,
    acc: &mut DependencyMap,
    kind: AccessKind,
) {
    // Aliases are collected across the whole source first: an assignment in
    // the main text is in scope for included parts.
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    for text in source.texts() {
        for caps in alias_assign_re().captures_iter(text) {
            aliases.insert(caps[1].to_string(), caps[2].to_string());
        }
    }

    for text in source.texts() {
        match kind {
            AccessKind::Results => {
                for caps in result_access_re().captures_iter(text) {
                    record(acc, &caps[1], caps[2].to_string(), own_handle);
                }
            }
            AccessKind::Custom => {
                for caps in custom_access_re().captures_iter(text) {
                    record(acc, &caps[1], format!("{}.{}", &caps[2], &caps[3]), own_handle);
                }
            }
        }
        for (alias, handle) in &aliases {
            let pattern = match kind {
                AccessKind::Results => format!(
                    r"\b{}\.results\.([A-Za-z0-9_]+)",
                    regex::escape(alias)
                ),
                AccessKind::Custom => format!(
                    r"\b{}\.custom\.([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)",
                    regex::escape(alias)
                ),
            };
            let Ok(deref_re) = Regex::new(&pattern) else {
                continue;
            };
            for caps in deref_re.captures_iter(text) {
                let field = match kind {
                    AccessKind::Results => caps[1].to_string(),
                    AccessKind::Custom => format!("{}.{}", &caps[1], &caps[2]),
                };
                record(acc, handle, field, own_handle);
            }
        }
    }
}

fn record(acc: &mut DependencyMap, handle: &str, field: String, own_handle: &str) {
    if handle == own_handle {
        return;
    }
    acc.entry(handle.to_string()).or_default().insert(field);
}

/// Company-level field references: `company.custom.<ns>.<key>` (custom) and
/// `company.<field>` (standard), deduplicated and split into the two
/// categories in first-seen order.
pub fn company_field_references(source: &TemplateSource) -> CompanyFieldReferences {
    let mut refs = CompanyFieldReferences::default();
    let mut seen_standard = BTreeSet::new();
    let mut seen_custom = BTreeSet::new();
    for text in source.texts() {
        for caps in company_custom_re().captures_iter(text) {
            let entry = format!("{}.{}", &caps[1], &caps[2]);
            if seen_custom.insert(entry.clone()) {
                refs.custom.push(entry);
            }
        }
        for caps in company_field_re().captures_iter(text) {
            let field = &caps[1];
            if field == "custom" {
                continue;
            }
            if seen_standard.insert(field.to_string()) {
                refs.standard.push(field.to_string());
            }
        }
    }
    refs
}

/// Hash-prefixed literal account numbers (`#<digits>`) in a serialized
/// structure, deduplicated, first-seen order. Run post-hoc over the
/// assembled fixture's text form, not over template source.
pub fn literal_account_references(serialized: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut numbers = Vec::new();
    for caps in account_literal_re().captures_iter(serialized) {
        let number = caps[1].to_string();
        if seen.insert(number.clone()) {
            numbers.push(number);
        }
    }
    numbers
}
