//! End-to-end fixture synthesis over stub collaborators.

mod common;

use common::{init_logging, StubData, StubStore};
use serde_json::json;
use serde_yaml::Value;
use template_harness::fixture::synthesize;
use template_harness::remote::{AccountDetail, CustomField, Period, PeriodPair, TemplateInstance};

const CURRENT: &str = "2023-12-31";

fn instance(id: u64, handle: &str) -> TemplateInstance {
    TemplateInstance {
        id,
        handle: handle.to_string(),
        starred: false,
    }
}

fn data_with_alpha() -> StubData {
    let mut data = StubData::default();
    data.instances.insert("alpha".to_string(), instance(1, "alpha"));
    data.periods.insert(
        1,
        PeriodPair {
            current: Period {
                id: CURRENT.to_string(),
            },
            previous: None,
        },
    );
    data
}

fn parse(document: &str) -> Value {
    serde_yaml::from_str(document).expect("generated fixture parses")
}

fn case<'a>(doc: &'a Value, name: &str) -> &'a Value {
    doc.get(name).expect("case present")
}

#[test]
fn dependency_free_template_synthesizes_minimal_case() {
    init_logging();
    let store = StubStore::default().with_template("alpha", "{{ period.year }}");
    let data = data_with_alpha();

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let doc = parse(&outcome.document);
    let mapping = doc.as_mapping().expect("document is a mapping");
    assert_eq!(mapping.len(), 1, "exactly one case");
    let case = case(&doc, "test_1");
    assert_eq!(
        case.get("expectation").and_then(|e| e.get("reconciled")),
        Some(&Value::Bool(true))
    );
    let periods = case
        .get("data")
        .and_then(|d| d.get("periods"))
        .and_then(Value::as_mapping)
        .expect("periods mapping");
    assert_eq!(periods.len(), 1);
    assert!(periods.contains_key(Value::String(CURRENT.to_string())));
    assert_eq!(
        case.get("context").and_then(|c| c.get("period")),
        Some(&Value::String(CURRENT.to_string()))
    );
}

#[test]
fn referenced_results_are_copied_from_the_dependency() {
    init_logging();
    let store = StubStore::default()
        .with_template("alpha", "{{ period.reconciliations.beta.results.total }}");
    let mut data = data_with_alpha();
    data.instances.insert("beta".to_string(), instance(2, "beta"));
    data.results
        .insert(2, [("total".to_string(), json!(42))].into_iter().collect());

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let doc = parse(&outcome.document);
    let copied = case(&doc, "test_1")
        .get("data")
        .and_then(|d| d.get("periods"))
        .and_then(|p| p.get(CURRENT))
        .and_then(|p| p.get("reconciliations"))
        .and_then(|r| r.get("beta"))
        .and_then(|b| b.get("results"))
        .and_then(|r| r.get("total"));
    assert_eq!(copied, Some(&Value::Number(42.into())));
}

#[test]
fn dependencies_found_through_shared_parts_are_included() {
    init_logging();
    let store = StubStore::default()
        .with_template("alpha", r#"{% include "shared/totals" %}"#)
        .with_shared_part(
            "totals",
            r#"{% include "shared/nested" %} {{ period.reconciliations.beta.results.net }}"#,
        )
        .with_shared_part("nested", "{{ period.reconciliations.gamma.results.sum }}");
    let mut data = data_with_alpha();
    data.instances.insert("beta".to_string(), instance(2, "beta"));
    data.results
        .insert(2, [("net".to_string(), json!(7))].into_iter().collect());
    data.instances.insert("gamma".to_string(), instance(3, "gamma"));
    data.results
        .insert(3, [("sum".to_string(), json!(9))].into_iter().collect());

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    assert!(outcome.document.contains("net: 7"));
    assert!(outcome.document.contains("sum: 9"));
}

#[test]
fn missing_dependency_is_skipped_without_failing() {
    init_logging();
    let store = StubStore::default()
        .with_template("alpha", "{{ period.reconciliations.ghost.results.total }}");
    let data = data_with_alpha();

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    assert!(!outcome.document.contains("ghost"));
    let written = store.written.lock().expect("lock");
    assert_eq!(written.len(), 1, "fixture still persisted");
}

#[test]
fn previous_period_is_recorded_as_empty_data() {
    init_logging();
    let store = StubStore::default().with_template("alpha", "{{ period.year }}");
    let mut data = data_with_alpha();
    data.periods.insert(
        1,
        PeriodPair {
            current: Period {
                id: CURRENT.to_string(),
            },
            previous: Some(Period {
                id: "2022-12-31".to_string(),
            }),
        },
    );

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let doc = parse(&outcome.document);
    let periods = case(&doc, "test_1")
        .get("data")
        .and_then(|d| d.get("periods"))
        .and_then(Value::as_mapping)
        .expect("periods mapping");
    assert_eq!(periods.len(), 2);
    assert_eq!(
        periods.get(Value::String("2022-12-31".to_string())),
        Some(&Value::Null)
    );
}

#[test]
fn own_custom_fields_appear_in_sorted_order() {
    init_logging();
    let store = StubStore::default().with_template("alpha", "{{ period.year }}");
    let mut data = data_with_alpha();
    data.custom.insert(
        1,
        vec![
            CustomField {
                namespace: "assets".to_string(),
                key: "item_10".to_string(),
                value: json!("c"),
            },
            CustomField {
                namespace: "assets".to_string(),
                key: "item_2".to_string(),
                value: json!("b"),
            },
            CustomField {
                namespace: "assets".to_string(),
                key: "item_1".to_string(),
                value: json!("a"),
            },
        ],
    );

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let first = outcome.document.find("assets.item_1:").expect("item_1 present");
    let second = outcome.document.find("assets.item_2:").expect("item_2 present");
    let third = outcome.document.find("assets.item_10:").expect("item_10 present");
    assert!(first < second && second < third, "numeric-aware order");
}

#[test]
fn referenced_accounts_are_enriched_with_details() {
    init_logging();
    let store = StubStore::default().with_template("alpha", "{{ period.year }}");
    let mut data = data_with_alpha();
    data.custom.insert(
        1,
        vec![CustomField {
            namespace: "accounts".to_string(),
            key: "cash".to_string(),
            value: json!("#280000"),
        }],
    );
    data.accounts.insert(
        "280000".to_string(),
        AccountDetail {
            id: 9000,
            name: "Cash at bank".to_string(),
            value: 1250.5,
        },
    );

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let doc = parse(&outcome.document);
    let account = case(&doc, "test_1")
        .get("data")
        .and_then(|d| d.get("periods"))
        .and_then(|p| p.get(CURRENT))
        .and_then(|p| p.get("accounts"))
        .and_then(|a| a.get("280000"))
        .expect("account entry");
    assert_eq!(account.get("name"), Some(&Value::String("Cash at bank".to_string())));
}

#[test]
fn referenced_company_fields_are_copied() {
    init_logging();
    let store = StubStore::default()
        .with_template("alpha", "{{ company.name }} {{ company.custom.fiscal.regime }}");
    let mut data = data_with_alpha();
    data.company.insert("name".to_string(), json!("Acme BV"));
    data.company_custom = vec![CustomField {
        namespace: "fiscal".to_string(),
        key: "regime".to_string(),
        value: json!("small"),
    }];

    let outcome = synthesize(&store, &data, "alpha", "test_1", true).expect("synthesize");

    let doc = parse(&outcome.document);
    let company = case(&doc, "test_1")
        .get("data")
        .and_then(|d| d.get("company"))
        .expect("company section");
    assert_eq!(company.get("name"), Some(&Value::String("Acme BV".to_string())));
    assert_eq!(
        company.get("custom").and_then(|c| c.get("fiscal.regime")),
        Some(&Value::String("small".to_string()))
    );
}

#[test]
fn missing_own_template_is_fatal() {
    init_logging();
    let store = StubStore::default();
    let data = data_with_alpha();
    assert!(synthesize(&store, &data, "alpha", "test_1", true).is_err());
}
