use dih_harvest::{ApiDonationRow, PageEnvelope};
use dih_storage::PartitionStore;

#[test]
fn decoded_page_persists_idempotently() {
    let body = include_str!("fixtures/page_2025-03.json");
    let envelope: PageEnvelope = serde_json::from_str(body).expect("decoding fixture page");
    assert_eq!(envelope.total_count, 4);

    let records: Vec<_> = envelope
        .rows
        .into_iter()
        .filter_map(ApiDonationRow::into_record)
        .collect();
    assert_eq!(records.len(), 4);

    let dir = tempfile::tempdir().expect("tempdir");
    let mut store =
        PartitionStore::open(dir.path().join("donations_2025-03.db")).expect("open partition");
    store.ensure_schema().expect("schema");

    // First delivery of the page, then a simulated retry of the same page.
    assert_eq!(store.save(&records).expect("first save"), 4);
    assert_eq!(store.save(&records).expect("retried save"), 0);

    let stored = store.load_all().expect("load");
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[0].id, 9001);
    assert_eq!(stored[0].amount, 500.0);
    assert_eq!(stored[3].currency.as_deref(), Some("EUR"));
}
