use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use txcore::catalog::types::TableId;
use txcore::privilege::ROOT_ROLE_NAME;
use txcore::{
    ColumnSpec, ColumnType, CoreConfig, Database, ScanRequest, TableSpec, Transaction, TxnError, TxnState, Value,
};

const WRITERS: usize = 6;
const ROWS_PER_WRITER: usize = 40;

fn open() -> Arc<Database> {
    Arc::new(Database::open_in_memory(CoreConfig::default()).expect("open"))
}

fn tickets(db: &Database) -> TableId {
    let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
    let table = tx
        .create_table(
            "PUBLIC",
            &TableSpec::new("tickets")
                .column(ColumnSpec::new("id", ColumnType::Integer).autonumber(1))
                .column(ColumnSpec::new("owner", ColumnType::Text))
                .primary_key("id"),
        )
        .expect("create");
    tx.commit().expect("commit");
    table
}

#[test]
fn concurrent_writers_never_share_an_autonumber() {
    let db = open();
    let table = tickets(&db);

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
                let owner = tx.metadata().column_by_name(table, "owner").expect("owner").column_id;
                for n in 0..ROWS_PER_WRITER {
                    tx.insert_record(table, &[(owner, Value::text(&format!("w{writer}-{n}")))])
                        .expect("insert");
                    if n % 8 == 7 {
                        tx.finish_command().expect("finish");
                    }
                }
                tx.commit().expect("commit");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
    let id = tx.metadata().column_by_name(table, "id").expect("id").column_id;
    let keys: Vec<i64> = tx
        .scan(&ScanRequest::new(table))
        .expect("scan")
        .filter_map(|r| r.row.get(id).as_i64())
        .collect();
    let distinct: BTreeSet<i64> = keys.iter().copied().collect();
    assert_eq!(keys.len(), WRITERS * ROWS_PER_WRITER);
    assert_eq!(distinct.len(), keys.len());
    assert_eq!(distinct.first(), Some(&1));
    assert_eq!(distinct.last(), Some(&((WRITERS * ROWS_PER_WRITER) as i64)));
}

#[test]
fn concurrent_ddl_commits_publish_every_table() {
    let db = open();
    let start = db.current_version();

    let handles: Vec<_> = (0..WRITERS)
        .map(|n| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
                tx.create_table(
                    "PUBLIC",
                    &TableSpec::new(&format!("ledger_{n}")).column(ColumnSpec::new("amount", ColumnType::Integer)),
                )
                .expect("create");
                let report = tx.commit().expect("commit");
                report.published_version.expect("published")
            })
        })
        .collect();
    let versions: BTreeSet<u32> = handles
        .into_iter()
        .map(|h| h.join().expect("ddl thread"))
        .collect();

    assert_eq!(versions.len(), WRITERS);
    assert!(versions.iter().all(|v| *v > start));
    let latest = db.current_metadata();
    assert_eq!(latest.version_id(), *versions.last().expect("version"));
    for n in 0..WRITERS {
        assert!(
            latest.table_by_name("PUBLIC", &format!("LEDGER_{n}")).is_some(),
            "table {n} missing from the published snapshot"
        );
    }
}

#[test]
fn readers_keep_their_snapshot_while_ddl_publishes() {
    let db = open();
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut last_seen = 0;
            while !stop.load(Ordering::Acquire) {
                let tx = db.begin(ROOT_ROLE_NAME).expect("begin");
                let pinned = tx.metadata().version_id();
                let tables = tx.metadata().live_tables().count();
                assert!(pinned >= last_seen, "published versions went backwards");
                thread::yield_now();
                assert_eq!(tx.metadata().version_id(), pinned);
                assert_eq!(tx.metadata().live_tables().count(), tables);
                last_seen = pinned;
                tx.rollback().expect("rollback");
            }
            last_seen
        })
    };

    for n in 0..10 {
        let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
        tx.create_table("PUBLIC", &TableSpec::new(&format!("t{n}")).column(ColumnSpec::new("v", ColumnType::Integer)))
            .expect("create");
        tx.commit().expect("commit");
    }
    stop.store(true, Ordering::Release);
    let last_seen = reader.join().expect("reader thread");
    assert!(last_seen <= db.current_version());
}

fn owners(tx: &mut Transaction, table: TableId) -> Vec<Value> {
    let owner = tx.metadata().column_by_name(table, "owner").expect("owner").column_id;
    let mut out: Vec<Value> = tx
        .scan(&ScanRequest::new(table))
        .expect("scan")
        .map(|r| r.row.get(owner).clone())
        .collect();
    out.sort();
    out
}

#[test]
fn second_writer_of_a_row_gets_a_conflict() {
    let db = open();
    let table = tickets(&db);
    let mut seed = db.begin(ROOT_ROLE_NAME).expect("begin");
    let owner = seed.metadata().column_by_name(table, "owner").expect("owner").column_id;
    seed.insert_record(table, &[(owner, Value::text("shared"))]).expect("insert");
    seed.commit().expect("commit");

    let mut first = db.begin(ROOT_ROLE_NAME).expect("begin");
    let mut second = db.begin(ROOT_ROLE_NAME).expect("begin");
    let row = first.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    first
        .update_record(table, Some(row.id), &row.row, &[(owner, Value::text("first"))], false, false)
        .expect("first update");

    let seen = second.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert_eq!(seen.id, row.id);
    second.insert_record(table, &[(owner, Value::text("bystander"))]).expect("insert");
    let err = second
        .update_record(table, Some(seen.id), &seen.row, &[(owner, Value::text("second"))], false, false)
        .expect_err("row held by the first writer");
    assert!(matches!(err, TxnError::Conflict(_)), "{err:?}");
    assert_eq!(second.state(), TxnState::Normal);
    let err = second.delete_record(table, seen.id, false, false).expect_err("row held by the first writer");
    assert!(matches!(err, TxnError::Conflict(_)), "{err:?}");
    assert_eq!(second.state(), TxnState::Normal);

    second.finish_command().expect("finish");
    assert_eq!(owners(&mut second, table), vec![Value::text("shared")]);
    assert!(second.modification_summary().is_empty());

    first.commit().expect("commit");
    let err = second
        .update_record(table, Some(seen.id), &seen.row, &[(owner, Value::text("second"))], false, false)
        .expect_err("row replaced by the first writer");
    assert!(matches!(err, TxnError::Conflict(_)), "{err:?}");
    second.insert_record(table, &[(owner, Value::text("later"))]).expect("insert");
    second.commit().expect("commit");

    let mut check = db.begin(ROOT_ROLE_NAME).expect("begin");
    assert_eq!(owners(&mut check, table), vec![Value::text("first"), Value::text("later")]);
}

#[test]
fn abort_handle_stops_a_running_transaction() {
    let db = open();
    let table = tickets(&db);
    let mut tx = db.begin(ROOT_ROLE_NAME).expect("begin");
    let owner = tx.metadata().column_by_name(table, "owner").expect("owner").column_id;
    tx.insert_record(table, &[(owner, Value::text("before"))]).expect("insert");

    let handle = tx.abort_handle();
    thread::spawn(move || handle.disconnect()).join().expect("abort thread");

    let err = tx
        .insert_record(table, &[(owner, Value::text("after"))])
        .expect_err("disconnected");
    assert_eq!(err, TxnError::Disconnect);
    assert_eq!(tx.state(), TxnState::ReadOnlyAfterError);
    assert!(matches!(tx.commit(), Err(TxnError::InvalidArg(_))));

    let mut check = db.begin(ROOT_ROLE_NAME).expect("begin");
    assert_eq!(check.scan(&ScanRequest::new(table)).expect("scan").count(), 0);
}
