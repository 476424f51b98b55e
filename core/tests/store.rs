//! Integration tests for the SQLite aging store.

mod common;

use common::{date, store};
use dunning_core::{
    aging::AgingBuckets,
    error::DunningError,
    store::{AgingStore, NewContact, NewInvoice},
};

fn contact(first: &str, email: Option<&str>, billing: bool) -> NewContact {
    NewContact {
        first_name: first.to_string(),
        last_name: String::new(),
        email: email.map(str::to_string),
        phone: None,
        is_billing_contact: billing,
    }
}

fn invoice<'a>(account_id: &'a str, number: &'a str, outstanding: f64) -> NewInvoice<'a> {
    NewInvoice {
        account_id,
        invoice_number: number,
        invoice_date: date(2025, 1, 1),
        invoice_amount: outstanding,
        total_outstanding: outstanding,
    }
}

#[test]
fn account_and_primary_contact_land_together() {
    let store = store();
    let (account, created) = store
        .create_account_with_contact("C1", "Acme", &contact("Jane", Some("jane@acme.io"), true))
        .unwrap();
    assert_eq!(created.account_id, account.account_id);

    // Same client id again: neither row is written.
    assert!(store
        .create_account_with_contact("C1", "Acme again", &contact("Joe", None, true))
        .is_err());
    assert_eq!(store.account_count().unwrap(), 1);
    assert_eq!(store.contact_count().unwrap(), 1);

    let found = store.get_account_by_client_id("C1").unwrap().unwrap();
    assert_eq!(found, account);
}

#[test]
fn savepoint_failure_only_undoes_its_own_writes() {
    let store = store();
    store.begin_batch().unwrap();
    store
        .create_account_with_contact("KEEP", "Kept", &contact("K", None, true))
        .unwrap();

    let failed: Result<(), DunningError> = store.in_savepoint("row", |s| {
        s.create_account_with_contact("GONE", "Gone", &contact("G", None, true))?;
        Err(DunningError::RowValidation("boom".into()))
    });
    assert!(failed.is_err());
    store.commit_batch().unwrap();

    assert!(store.get_account_by_client_id("KEEP").unwrap().is_some());
    assert!(store.get_account_by_client_id("GONE").unwrap().is_none());
}

#[test]
fn latest_snapshot_prefers_newest_date_then_insertion() {
    let store = store();
    let (account, _) = store
        .create_account_with_contact("C1", "Acme", &contact("A", None, true))
        .unwrap();
    let inv = store.create_invoice(&invoice(&account.account_id, "INV-1", 30.0)).unwrap();

    let early = AgingBuckets::new(30.0, 0.0, 0.0, 0.0, 0.0);
    let later = AgingBuckets::new(0.0, 30.0, 0.0, 0.0, 0.0);
    let same_day = AgingBuckets::new(0.0, 0.0, 30.0, 0.0, 0.0);
    store.create_snapshot(&inv.invoice_id, date(2025, 2, 1), &later).unwrap();
    store.create_snapshot(&inv.invoice_id, date(2025, 1, 1), &early).unwrap();
    assert_eq!(
        store.latest_snapshot(&inv.invoice_id).unwrap().unwrap().buckets,
        later
    );

    store.create_snapshot(&inv.invoice_id, date(2025, 2, 1), &same_day).unwrap();
    assert_eq!(
        store.latest_snapshot(&inv.invoice_id).unwrap().unwrap().buckets,
        same_day
    );
    assert_eq!(store.snapshots_for_invoice(&inv.invoice_id).unwrap().len(), 3);
}

#[test]
fn negative_bucket_is_refused_by_schema() {
    let store = store();
    let (account, _) = store
        .create_account_with_contact("C1", "Acme", &contact("A", None, true))
        .unwrap();
    let inv = store.create_invoice(&invoice(&account.account_id, "INV-1", 0.0)).unwrap();
    let bad = AgingBuckets::new(-1.0, 1.0, 0.0, 0.0, 0.0);
    assert!(store.create_snapshot(&inv.invoice_id, date(2025, 1, 1), &bad).is_err());
    assert!(store.latest_snapshot(&inv.invoice_id).unwrap().is_none());
}

#[test]
fn batch_lookup_keeps_requested_order_and_picks_billing_contact() {
    let store = store();
    let (a, _) = store
        .create_account_with_contact("A", "Alpha", &contact("Ops", Some("ops@alpha.io"), false))
        .unwrap();
    store
        .add_contact(&a.account_id, &contact("Bills", Some("ap@alpha.io"), true))
        .unwrap();
    let (b, _) = store
        .create_account_with_contact("B", "Beta", &contact("B", Some("b@beta.io"), true))
        .unwrap();

    let ids = vec![b.account_id.clone(), "missing".to_string(), a.account_id.clone()];
    let found = store.accounts_with_contacts(&ids).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].account.client_id, "B");
    assert_eq!(found[1].account.client_id, "A");
    assert_eq!(found[1].contacts.len(), 2);
    assert_eq!(
        found[1].primary_contact().unwrap().email.as_deref(),
        Some("ap@alpha.io")
    );
}

#[test]
fn receivables_summary_totals_invoices() {
    let store = store();
    let (account, _) = store
        .create_account_with_contact("C1", "Acme", &contact("A", None, true))
        .unwrap();
    store.create_invoice(&invoice(&account.account_id, "INV-1", 100.0)).unwrap();
    let inv = store.create_invoice(&invoice(&account.account_id, "INV-2", 50.0)).unwrap();
    store.update_invoice_amounts(&inv.invoice_id, 50.0, 20.0).unwrap();

    let summary = store.receivables_summary().unwrap();
    assert_eq!(summary.account_count, 1);
    assert_eq!(summary.invoice_count, 2);
    assert!((summary.total_invoiced - 150.0).abs() < 1e-9);
    assert!((summary.total_outstanding - 120.0).abs() < 1e-9);
}

#[test]
fn file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dunning.db");
    let path = path.to_str().unwrap();

    {
        let store = AgingStore::open(path).unwrap();
        store.migrate().unwrap();
        store
            .create_account_with_contact("C1", "Acme", &contact("A", None, true))
            .unwrap();
    }

    let store = AgingStore::open(path).unwrap();
    store.migrate().unwrap();
    assert_eq!(store.path(), Some(path));
    assert_eq!(store.account_count().unwrap(), 1);
}
