//! Integration tests for versioned email templates.
//!
//! Every write appends a version; exactly one version per identifier is
//! active after create, update or activate.

mod common;

use common::store;
use dunning_core::{
    error::DunningError,
    templates::{TemplateData, TemplateService},
};

fn data(subject: &str) -> TemplateData {
    TemplateData::new(subject, "<p>Dear {{account_name}}, please pay {{total_outstanding}}.</p>")
}

#[test]
fn create_starts_at_version_one() {
    let store = store();
    let service = TemplateService::new(&store);
    let row = service.create("  ESCALATION_LEVEL_1 ", &data("Reminder")).unwrap();

    assert_eq!(row.identifier, "ESCALATION_LEVEL_1");
    assert_eq!(row.version, 1);
    assert!(row.is_active);
    assert!(service.exists("ESCALATION_LEVEL_1").unwrap());
    assert_eq!(service.identifiers().unwrap(), vec!["ESCALATION_LEVEL_1"]);
}

#[test]
fn each_write_appends_and_keeps_one_active() {
    let store = store();
    let service = TemplateService::new(&store);
    service.create("ESCALATION_LEVEL_2", &data("v1")).unwrap();
    service.create("ESCALATION_LEVEL_2", &data("v2")).unwrap();
    let (row, previous) = service.update("ESCALATION_LEVEL_2", &data("v3")).unwrap();

    assert_eq!(row.version, 3);
    assert_eq!(previous, Some(2));
    assert_eq!(store.active_version_count("ESCALATION_LEVEL_2").unwrap(), 1);

    let versions = service.versions("ESCALATION_LEVEL_2").unwrap();
    let listed: Vec<(i64, bool)> = versions.iter().map(|v| (v.version, v.is_active)).collect();
    assert_eq!(listed, vec![(3, true), (2, false), (1, false)]);

    // Old versions are kept verbatim.
    let v1 = service.version("ESCALATION_LEVEL_2", 1).unwrap().unwrap();
    assert_eq!(v1.data.subject, "v1");
}

#[test]
fn activating_an_old_version_switches_the_active_one() {
    let store = store();
    let service = TemplateService::new(&store);
    service.create("ESCALATION_LEVEL_3", &data("first")).unwrap();
    service.create("ESCALATION_LEVEL_3", &data("second")).unwrap();

    let (row, previous) = service.activate("ESCALATION_LEVEL_3", 1).unwrap();
    assert_eq!(row.version, 1);
    assert_eq!(previous, Some(2));
    assert_eq!(service.get("ESCALATION_LEVEL_3").unwrap().unwrap().data.subject, "first");
    assert_eq!(store.active_version_count("ESCALATION_LEVEL_3").unwrap(), 1);

    // A new write after activation still becomes the next version.
    let row = service.create("ESCALATION_LEVEL_3", &data("third")).unwrap();
    assert_eq!(row.version, 3);
    assert_eq!(store.active_version_count("ESCALATION_LEVEL_3").unwrap(), 1);
}

#[test]
fn activating_a_missing_version_changes_nothing() {
    let store = store();
    let service = TemplateService::new(&store);
    service.create("ESCALATION_LEVEL_1", &data("only")).unwrap();

    let err = service.activate("ESCALATION_LEVEL_1", 7).unwrap_err();
    assert!(matches!(err, DunningError::NotFound(_)));
    assert_eq!(service.get("ESCALATION_LEVEL_1").unwrap().unwrap().version, 1);
}

#[test]
fn update_requires_an_existing_identifier() {
    let store = store();
    let service = TemplateService::new(&store);
    let err = service.update("NOPE", &data("x")).unwrap_err();
    assert!(matches!(err, DunningError::NotFound(_)));
    assert!(!service.exists("NOPE").unwrap());
}

#[test]
fn delete_removes_every_version() {
    let store = store();
    let service = TemplateService::new(&store);
    service.create("ESCALATION_LEVEL_1", &data("a")).unwrap();
    service.create("ESCALATION_LEVEL_1", &data("b")).unwrap();

    assert_eq!(service.delete("ESCALATION_LEVEL_1").unwrap(), 2);
    assert!(!service.exists("ESCALATION_LEVEL_1").unwrap());
    assert!(service.get("ESCALATION_LEVEL_1").unwrap().is_none());
    assert_eq!(service.delete("ESCALATION_LEVEL_1").unwrap(), 0);
}

#[test]
fn invalid_content_is_rejected_and_scripts_stripped() {
    let store = store();
    let service = TemplateService::new(&store);

    let err = service
        .create("ESCALATION_LEVEL_1", &TemplateData::new("", "<p>body</p>"))
        .unwrap_err();
    assert!(matches!(err, DunningError::InvalidTemplate(_)));
    assert!(!service.exists("ESCALATION_LEVEL_1").unwrap());

    let row = service
        .create(
            "ESCALATION_LEVEL_1",
            &TemplateData::new("Pay up", "<p onclick=\"x()\">Hi</p><script>steal()</script>"),
        )
        .unwrap();
    assert_eq!(row.data.body, "<p>Hi</p>");
}

#[test]
fn listing_is_paginated_over_active_versions() {
    let store = store();
    let service = TemplateService::new(&store);
    for level in 1..=3 {
        let id = format!("ESCALATION_LEVEL_{level}");
        service.create(&id, &data("a")).unwrap();
        service.create(&id, &data("b")).unwrap();
    }

    let page = service.list(1, 1).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.templates.len(), 1);
    assert!(page.templates[0].is_active);

    let summaries = service.summaries().unwrap();
    assert_eq!(summaries.len(), 3);
    assert!(summaries.iter().all(|s| s.template_data.subject == "b"));
}
