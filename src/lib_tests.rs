use super::{
    ColumnSpec, ColumnType, CoreConfig, Database, OnDelete, PrivilegeDescriptor, PrivilegeKind,
    RecordId, ScanRequest, TableSpec, Transaction, TxnError, TxnState, Value,
};
use crate::access::{AccessHandler, WriteAction};
use crate::catalog::types::{ColumnId, Row, TableId, TxnId};
use crate::error::Result;
use crate::privilege::{Grantability, ROOT_ROLE_NAME};
use crate::storage::{MemoryStorage, StorageEngine};
use std::collections::BTreeSet;
use std::sync::Arc;

fn open() -> Database {
    Database::open_in_memory(CoreConfig::default()).expect("open database")
}

fn root(db: &Database) -> Transaction {
    db.begin(ROOT_ROLE_NAME).expect("begin as root")
}

fn col(tx: &Transaction, table: TableId, name: &str) -> ColumnId {
    tx.metadata()
        .column_by_name(table, name)
        .unwrap_or_else(|| panic!("column {name}"))
        .column_id
}

fn values(tx: &mut Transaction, table: TableId, column: ColumnId) -> Vec<Value> {
    let mut out: Vec<Value> = tx
        .scan(&ScanRequest::new(table))
        .expect("scan")
        .map(|r| r.row.get(column).clone())
        .collect();
    out.sort();
    out
}

fn keyed_table(name: &str) -> TableSpec {
    TableSpec::new(name)
        .column(ColumnSpec::new("id", ColumnType::Integer).autonumber(1))
        .column(ColumnSpec::new("label", ColumnType::Text).max_size(16))
        .primary_key("id")
}

fn select() -> PrivilegeDescriptor {
    PrivilegeDescriptor::of(&[PrivilegeKind::ColumnSelect], Grantability::Granted)
}

#[test]
fn autonumber_keeps_climbing_after_a_delete() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("items")).expect("create");
    let id = col(&tx, table, "id");
    let label = col(&tx, table, "label");

    let first = tx.insert_record(table, &[(label, Value::text("a"))]).expect("insert a");
    tx.insert_record(table, &[(label, Value::text("b"))]).expect("insert b");
    tx.delete_record(table, first, false, false).expect("delete a");
    tx.insert_record(table, &[(label, Value::text("c"))]).expect("insert c");
    tx.finish_command().expect("finish");

    assert_eq!(values(&mut tx, table, id), vec![Value::Integer(2), Value::Integer(3)]);
    let report = tx.commit().expect("commit");
    let summary = &report.changes[&table];
    assert_eq!((summary.inserted, summary.deleted), (2, 0));
}

#[test]
fn own_writes_appear_once_the_command_closes() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("notes")).expect("create");
    let label = col(&tx, table, "label");
    tx.insert_record(table, &[(label, Value::text("draft"))]).expect("insert");
    assert!(values(&mut tx, table, label).is_empty());
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, label), vec![Value::text("draft")]);
}

#[test]
fn update_writes_a_new_version_only_on_change() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("tags")).expect("create");
    let label = col(&tx, table, "label");
    let id = tx.insert_record(table, &[(label, Value::text("old"))]).expect("insert");
    tx.finish_command().expect("finish");
    let row = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row").row;

    let (changed, same) = tx
        .update_record(table, Some(id), &row, &[(label, Value::text("old"))], false, false)
        .expect("no-op update");
    assert!(!changed);
    assert_eq!(same, id);

    let (changed, next) = tx
        .update_record(table, Some(id), &row, &[(label, Value::text("new"))], false, false)
        .expect("update");
    assert!(changed);
    assert_ne!(next, id);
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, label), vec![Value::text("new")]);
    let summary = tx.modification_summary();
    assert_eq!(summary[&table].inserted, 1);
    assert_eq!(summary[&table].updated, 0);
}

#[test]
fn no_update_column_is_filled_once() {
    let db = open();
    let mut tx = root(&db);
    let spec = TableSpec::new("badges")
        .column(ColumnSpec::new("id", ColumnType::Integer).autonumber(1))
        .column(ColumnSpec::new("holder", ColumnType::Text))
        .column(ColumnSpec::new("code", ColumnType::Text).no_update())
        .primary_key("id");
    let table = tx.create_table("PUBLIC", &spec).expect("create");
    let (holder, code) = (col(&tx, table, "holder"), col(&tx, table, "code"));
    tx.insert_record(table, &[(holder, Value::text("ann"))]).expect("insert");
    tx.finish_command().expect("finish");

    let blank = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert!(blank.row.get(code).is_null());
    let (changed, filled) = tx
        .update_record(table, Some(blank.id), &blank.row, &[(code, Value::text("X"))], false, false)
        .expect("fill the empty code");
    assert!(changed);
    tx.finish_command().expect("finish");

    let current = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert_eq!(current.id, filled);
    let err = tx
        .update_record(table, Some(current.id), &current.row, &[(code, Value::text("Y"))], false, false)
        .expect_err("code already set");
    assert!(matches!(err, TxnError::Constraint(_)), "{err:?}");
    assert_eq!(tx.state(), TxnState::Normal);

    tx.update_record(table, Some(current.id), &current.row, &[(holder, Value::text("bea"))], false, false)
        .expect("other columns stay writable");
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, code), vec![Value::text("X")]);
    assert_eq!(values(&mut tx, table, holder), vec![Value::text("bea")]);
}

#[test]
fn clustering_updates_rewrite_unchanged_rows() {
    let config = CoreConfig {
        clustering_updates: true,
        ..CoreConfig::default()
    };
    let db = Database::open_in_memory(config).expect("open database");
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("shelves")).expect("create");
    let label = col(&tx, table, "label");
    tx.insert_record(table, &[(label, Value::text("oak"))]).expect("insert");
    tx.commit().expect("commit");

    let mut tx = root(&db);
    let row = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    let (changed, next) = tx
        .update_record(table, Some(row.id), &row.row, &[(label, Value::text("oak"))], false, false)
        .expect("same value");
    assert!(changed);
    assert_ne!(next, row.id);
    tx.finish_command().expect("finish");

    let ids: Vec<RecordId> = tx.scan(&ScanRequest::new(table)).expect("scan").map(|r| r.id).collect();
    assert_eq!(ids, vec![next]);
    assert_eq!(values(&mut tx, table, label), vec![Value::text("oak")]);
    let summary = tx.modification_summary();
    assert_eq!(summary[&table].updated, 1);
    assert!(summary[&table].modified_columns.is_empty());
}

#[test]
fn legacy_blobs_are_upgraded_by_the_next_update() {
    let storage = Arc::new(MemoryStorage::new());
    let db = Database::open(CoreConfig::default(), storage.clone()).expect("open database");
    let mut tx = root(&db);
    let spec = TableSpec::new("files")
        .column(ColumnSpec::new("id", ColumnType::Integer))
        .column(ColumnSpec::new("name", ColumnType::Text))
        .column(ColumnSpec::new("data", ColumnType::Blob))
        .primary_key("id");
    let table = tx.create_table("PUBLIC", &spec).expect("create");
    let (id, name, data) = (col(&tx, table, "id"), col(&tx, table, "name"), col(&tx, table, "data"));
    tx.commit().expect("commit");

    let loader = storage.begin();
    let legacy = Row::new()
        .with(id, Value::Integer(1))
        .with(name, Value::text("a.bin"))
        .with(data, Value::LegacyBlob(vec![7, 8, 9]));
    storage.write_new_record(loader, 0, table, &legacy, None, false).expect("write");
    storage.commit(loader).expect("commit");

    let mut tx = root(&db);
    let row = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert!(row.row.get(data).needs_blob_upgrade());
    let (changed, next) = tx
        .update_record(table, Some(row.id), &row.row, &[(name, Value::text("b.bin"))], false, false)
        .expect("rename");
    assert!(changed);
    tx.finish_command().expect("finish");

    let stored = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert_eq!(stored.id, next);
    assert!(!stored.row.get(data).needs_blob_upgrade());
    assert_eq!(stored.row.get(data), &Value::Blob(vec![7, 8, 9]));
    let summary = tx.modification_summary();
    assert_eq!(summary[&table].updated, 1);
    assert_eq!(summary[&table].modified_columns, BTreeSet::from([name, data]));
}

#[test]
fn denied_insert_does_not_consume_an_autonumber() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("orders")).expect("create");
    tx.create_role("clerk").expect("role");
    tx.commit().expect("commit");

    let mut clerk = db.begin("CLERK").expect("begin as clerk");
    let label = col(&clerk, table, "label");
    let err = clerk
        .insert_record(table, &[(label, Value::text("sneaky"))])
        .expect_err("no insert privilege");
    assert!(matches!(err, TxnError::WriteAccessDenied { .. }), "{err:?}");
    clerk.rollback().expect("rollback");

    let mut tx = root(&db);
    let id = col(&tx, table, "id");
    tx.insert_record(table, &[(label, Value::text("first"))]).expect("insert");
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, id), vec![Value::Integer(1)]);
}

#[test]
fn column_constraints_reject_bad_rows() {
    let db = open();
    let mut tx = root(&db);
    let spec = TableSpec::new("people")
        .column(ColumnSpec::new("id", ColumnType::Integer))
        .column(ColumnSpec::new("email", ColumnType::Text).unique())
        .column(ColumnSpec::new("name", ColumnType::Text).not_null().max_size(4))
        .primary_key("id");
    let table = tx.create_table("PUBLIC", &spec).expect("create");
    let (id, email, name) = (col(&tx, table, "id"), col(&tx, table, "email"), col(&tx, table, "name"));

    let row = |key: i64, mail: &str, who: &str| {
        vec![
            (id, Value::Integer(key)),
            (email, Value::text(mail)),
            (name, Value::text(who)),
        ]
    };
    let first = tx.insert_record(table, &row(1, "a@x", "ann")).expect("insert");
    tx.finish_command().expect("finish");

    let dup = tx.insert_record(table, &row(2, "a@x", "bob"));
    assert!(matches!(dup, Err(TxnError::Constraint(_))), "{dup:?}");

    let missing = tx.insert_record(table, &[(id, Value::Integer(3))]);
    assert!(matches!(missing, Err(TxnError::ConstraintNotNull { .. })), "{missing:?}");

    let long = tx.insert_record(table, &row(4, "d@x", "dorothy"));
    assert!(matches!(long, Err(TxnError::Constraint(_))), "{long:?}");

    let wrong_type = tx.insert_record(table, &[(id, Value::text("five"))]);
    assert!(matches!(wrong_type, Err(TxnError::InvalidArg(_))), "{wrong_type:?}");

    let stored = tx.scan(&ScanRequest::new(table)).expect("scan").next().expect("row");
    assert_eq!(stored.id, first);
    let key_change = tx.update_record(table, Some(first), &stored.row, &[(id, Value::Integer(9))], false, false);
    assert!(matches!(key_change, Err(TxnError::Constraint(_))), "{key_change:?}");
    assert_eq!(tx.state(), TxnState::Normal);
}

#[test]
fn restrict_reference_blocks_the_delete() {
    let db = open();
    let mut tx = root(&db);
    let customers = tx.create_table("PUBLIC", &keyed_table("customers")).expect("customers");
    let orders = tx
        .create_table(
            "PUBLIC",
            &keyed_table("orders")
                .column(ColumnSpec::new("customer", ColumnType::Integer).references("PUBLIC", "customers", OnDelete::Illegal)),
        )
        .expect("orders");
    let customer_id = col(&tx, customers, "id");
    let customer_ref = col(&tx, orders, "customer");

    let c = tx.insert_record(customers, &[(customer_id, Value::Integer(10))]).expect("customer");
    tx.insert_record(orders, &[(customer_ref, Value::Integer(10))]).expect("order");
    tx.finish_command().expect("finish");

    tx.delete_record(customers, c, false, false).expect("delete");
    let err = tx.finish_command().expect_err("restricted");
    assert!(matches!(err, TxnError::Constraint(_)), "{err:?}");
    assert_eq!(values(&mut tx, customers, customer_id), vec![Value::Integer(10)]);

    let dangling = tx.insert_record(orders, &[(customer_ref, Value::Integer(99))]);
    assert!(dangling.is_ok());
    let err = tx.finish_command().expect_err("missing key");
    assert!(matches!(err, TxnError::Constraint(_)), "{err:?}");
    assert_eq!(tx.state(), TxnState::Normal);
}

#[test]
fn cascade_follows_references_transitively() {
    let db = open();
    let mut tx = root(&db);
    let customers = tx.create_table("PUBLIC", &keyed_table("customers")).expect("customers");
    let orders = tx
        .create_table(
            "PUBLIC",
            &keyed_table("orders")
                .column(ColumnSpec::new("customer", ColumnType::Integer).references("PUBLIC", "customers", OnDelete::Cascade)),
        )
        .expect("orders");
    let lines = tx
        .create_table(
            "PUBLIC",
            &keyed_table("lines")
                .column(ColumnSpec::new("order_id", ColumnType::Integer).references("PUBLIC", "orders", OnDelete::Cascade)),
        )
        .expect("lines");
    let (customer_id, order_id, line_id) = (col(&tx, customers, "id"), col(&tx, orders, "id"), col(&tx, lines, "id"));
    let (customer_ref, order_ref) = (col(&tx, orders, "customer"), col(&tx, lines, "order_id"));

    let keep = tx.insert_record(customers, &[(customer_id, Value::Integer(1))]).expect("customer 1");
    let gone = tx.insert_record(customers, &[(customer_id, Value::Integer(2))]).expect("customer 2");
    tx.insert_record(orders, &[(order_id, Value::Integer(10)), (customer_ref, Value::Integer(1))])
        .expect("order 10");
    tx.insert_record(orders, &[(order_id, Value::Integer(20)), (customer_ref, Value::Integer(2))])
        .expect("order 20");
    tx.insert_record(lines, &[(order_ref, Value::Integer(10))]).expect("line of 10");
    tx.insert_record(lines, &[(order_ref, Value::Integer(20))]).expect("line of 20");
    tx.finish_command().expect("finish inserts");

    tx.delete_record(customers, gone, false, false).expect("delete");
    tx.finish_command().expect("cascade");

    assert_eq!(values(&mut tx, orders, order_id), vec![Value::Integer(10)]);
    assert_eq!(values(&mut tx, lines, order_ref), vec![Value::Integer(10)]);
    assert_eq!(values(&mut tx, lines, line_id).len(), 1);
    assert!(tx.scan(&ScanRequest::new(customers).add_record_search([keep])).expect("scan").next().is_some());
    let summary = tx.modification_summary();
    assert_eq!(summary[&orders].inserted, 1);
    assert_eq!(summary[&lines].inserted, 1);
}

#[test]
fn set_default_rewrites_the_referencing_cell() {
    let db = open();
    let mut tx = root(&db);
    let parents = tx.create_table("PUBLIC", &keyed_table("parents")).expect("parents");
    let children = tx
        .create_table(
            "PUBLIC",
            &keyed_table("children")
                .column(ColumnSpec::new("parent", ColumnType::Integer).references("PUBLIC", "parents", OnDelete::SetDefault)),
        )
        .expect("children");
    let parent_id = col(&tx, parents, "id");
    let parent_ref = col(&tx, children, "parent");
    let p = tx.insert_record(parents, &[(parent_id, Value::Integer(5))]).expect("parent");
    tx.insert_record(children, &[(parent_ref, Value::Integer(5))]).expect("child");
    tx.finish_command().expect("finish");

    tx.delete_record(parents, p, false, false).expect("delete");
    tx.finish_command().expect("set default");
    assert_eq!(values(&mut tx, children, parent_ref), vec![Value::Null]);
}

#[test]
fn cascade_disabled_restricts_every_reference() {
    let config = CoreConfig {
        cascade_enabled: false,
        ..CoreConfig::default()
    };
    let db = Database::open_in_memory(config).expect("open");
    let mut tx = root(&db);
    let parents = tx.create_table("PUBLIC", &keyed_table("parents")).expect("parents");
    let children = tx
        .create_table(
            "PUBLIC",
            &keyed_table("children")
                .column(ColumnSpec::new("parent", ColumnType::Integer).references("PUBLIC", "parents", OnDelete::Cascade)),
        )
        .expect("children");
    let parent_id = col(&tx, parents, "id");
    let parent_ref = col(&tx, children, "parent");
    let p = tx.insert_record(parents, &[(parent_id, Value::Integer(5))]).expect("parent");
    tx.insert_record(children, &[(parent_ref, Value::Integer(5))]).expect("child");
    tx.finish_command().expect("finish");

    tx.delete_record(parents, p, false, false).expect("delete");
    assert!(matches!(tx.finish_command(), Err(TxnError::Constraint(_))));
}

#[test]
fn read_only_states_refuse_or_drop_writes() {
    let db = open();
    let mut setup = root(&db);
    let table = setup.create_table("PUBLIC", &keyed_table("items")).expect("create");
    setup.commit().expect("commit");

    let mut tx = root(&db);
    let label = col(&tx, table, "label");
    tx.set_read_only();
    assert_eq!(
        tx.insert_record(table, &[(label, Value::text("x"))]),
        Err(TxnError::ReadOnlyTransaction)
    );
    assert!(tx.scan(&ScanRequest::new(table)).is_ok());
    tx.rollback().expect("rollback");

    let mut tx = root(&db);
    tx.abort_handle().disconnect();
    assert_eq!(
        tx.insert_record(table, &[(label, Value::text("x"))]),
        Err(TxnError::Disconnect)
    );
    assert_eq!(tx.state(), TxnState::ReadOnlyAfterError);
    assert_eq!(
        tx.insert_record(table, &[(label, Value::text("y"))]),
        Ok(RecordId::INVALID)
    );
    assert_eq!(tx.create_schema("LATE"), Err(TxnError::ReadOnlyTransaction));
    assert!(matches!(tx.commit(), Err(TxnError::InvalidArg(_))));

    let mut check = root(&db);
    assert!(values(&mut check, table, label).is_empty());
}

#[test]
fn pinned_snapshot_survives_a_concurrent_ddl_commit() {
    let db = open();
    let reader = root(&db);
    let before = db.current_version();

    let mut writer = root(&db);
    writer.create_schema("APP").expect("schema");
    writer.create_table("APP", &keyed_table("events")).expect("table");
    let report = writer.commit().expect("commit");

    let published = report.published_version.expect("metadata changed");
    assert!(published > before);
    assert_eq!(db.current_version(), published);
    assert!(reader.metadata().table_by_name("APP", "EVENTS").is_none());
    assert!(db.current_metadata().table_by_name("app", "events").is_some());
    assert!(!reader.metadata_ref().ptr_eq(&db.current_metadata()));
}

#[test]
fn rolled_back_ddl_leaves_no_trace() {
    let db = open();
    let mut tx = root(&db);
    tx.create_schema("TEMP").expect("schema");
    tx.rollback().expect("rollback");
    assert!(db.current_metadata().schema_by_name("TEMP").is_none());

    let mut tx = root(&db);
    tx.create_schema("TEMP").expect("name is free again");
    assert!(matches!(tx.create_schema("temp"), Err(TxnError::Constraint(_))));
}

#[test]
fn concurrent_creation_of_the_same_name_conflicts() {
    let db = open();
    let mut first = root(&db);
    let mut second = root(&db);
    first.create_schema("SHARED").expect("first");
    let err = second.create_schema("SHARED").expect_err("second");
    assert!(matches!(err, TxnError::Conflict(_)), "{err:?}");
    first.commit().expect("commit");
}

fn setup_roles(db: &Database) -> TableId {
    let mut tx = root(db);
    for role in ["ADMIN", "ALICE", "BOB"] {
        tx.create_role(role).expect("role");
    }
    tx.create_schema("APP").expect("schema");
    let table = tx.create_table("APP", &keyed_table("accounts")).expect("table");
    tx.grant_privileges(table, "ADMIN", PrivilegeDescriptor::all(Grantability::WithGrantOption))
        .expect("grant to admin");
    tx.commit().expect("commit");
    table
}

#[test]
fn grant_options_limit_who_can_pass_privileges_on() {
    let db = open();
    let table = setup_roles(&db);

    let mut admin = db.begin("admin").expect("admin");
    admin.grant_privileges(table, "ALICE", select()).expect("admin grants select");
    admin.commit().expect("commit");

    let mut alice = db.begin("alice").expect("alice");
    assert!(alice.scan(&ScanRequest::new(table)).is_ok());
    let label = col(&alice, table, "label");
    assert!(matches!(
        alice.insert_record(table, &[(label, Value::text("x"))]),
        Err(TxnError::WriteAccessDenied { .. })
    ));
    assert!(matches!(
        alice.grant_privileges(table, "BOB", select()),
        Err(TxnError::WriteAccessDenied { .. })
    ));
    alice.rollback().expect("rollback");

    let mut bob = db.begin("bob").expect("bob");
    assert!(matches!(
        bob.scan(&ScanRequest::new(table)),
        Err(TxnError::ReadAccessDenied { .. })
    ));
}

#[test]
fn revoking_the_root_grant_reconciles_dependent_grants() {
    let db = open();
    let table = setup_roles(&db);
    let mut admin = db.begin("ADMIN").expect("admin");
    admin.grant_privileges(table, "ALICE", select()).expect("grant");
    admin.commit().expect("commit");

    let mut tx = root(&db);
    tx.revoke_privileges(table, "ADMIN", PrivilegeDescriptor::all(Grantability::WithGrantOption))
        .expect("revoke");
    let graph = tx.metadata().privileges();
    let alice = graph.role_by_name("ALICE").expect("alice").role_id;
    assert_eq!(graph.abandoned_grants().count(), 0);
    assert!(graph.grants().all(|g| g.grantee != alice));
    tx.commit().expect("commit");

    let mut alice = db.begin("ALICE").expect("alice");
    assert!(matches!(
        alice.scan(&ScanRequest::new(table)),
        Err(TxnError::ReadAccessDenied { .. })
    ));
}

#[test]
fn schema_owners_create_tables_and_others_cannot() {
    let db = open();
    setup_roles(&db);

    let mut alice = db.begin("ALICE").expect("alice");
    let schema = alice.create_schema("ALICE_APP").expect("schema");
    let table = alice.create_table("ALICE_APP", &keyed_table("diary")).expect("table");
    let label = col(&alice, table, "label");
    alice.insert_record(table, &[(label, Value::text("day 1"))]).expect("owner writes");
    alice.commit().expect("commit");

    let mut bob = db.begin("BOB").expect("bob");
    assert!(matches!(
        bob.create_table("ALICE_APP", &keyed_table("intruder")),
        Err(TxnError::WriteAccessDenied { .. })
    ));
    assert!(matches!(
        bob.create_table("SYSTEM", &keyed_table("intruder")),
        Err(TxnError::WriteAccessDenied { .. })
    ));
    assert!(matches!(bob.drop_object(schema), Err(TxnError::WriteAccessDenied { .. })));
    bob.rollback().expect("rollback");

    let mut tx = root(&db);
    assert!(matches!(tx.drop_role("ALICE"), Err(TxnError::Constraint(_))));
}

#[test]
fn role_grants_enable_roles_and_refuse_cycles() {
    let db = open();
    let table = setup_roles(&db);

    let mut tx = root(&db);
    tx.grant_role("ADMIN", "ALICE", false).expect("grant admin to alice");
    let err = tx.grant_role("ALICE", "ADMIN", false).expect_err("cycle");
    assert!(matches!(err, TxnError::Constraint(_)), "{err:?}");
    tx.commit().expect("commit");

    let mut alice = db.begin("ALICE").expect("alice");
    let label = col(&alice, table, "label");
    alice.insert_record(table, &[(label, Value::text("via admin"))]).expect("inherited insert");
    alice.set_role("ADMIN").expect("set role");
    assert_eq!(alice.effective_role(), alice.metadata().privileges().role_by_name("ADMIN").expect("admin").role_id);
    assert!(matches!(alice.set_role("BOB"), Err(TxnError::InvalidArg(_))));
    alice.reset_role();
    assert_eq!(alice.effective_role(), alice.base_role());
    assert!(matches!(
        alice.grant_role("ADMIN", "BOB", false),
        Err(TxnError::WriteAccessDenied { .. })
    ));
}

#[test]
fn dropping_a_table_checks_incoming_references() {
    let db = open();
    let mut tx = root(&db);
    let parents = tx.create_table("PUBLIC", &keyed_table("parents")).expect("parents");
    tx.create_table(
        "PUBLIC",
        &keyed_table("children")
            .column(ColumnSpec::new("parent", ColumnType::Integer).references("PUBLIC", "parents", OnDelete::Cascade)),
    )
    .expect("children");
    let parent_label = col(&tx, parents, "label");
    assert!(matches!(tx.drop_object(parents), Err(TxnError::Constraint(_))));

    tx.drop_table("PUBLIC", "children").expect("drop children");
    tx.drop_object(parents).expect("drop parents");
    assert!(tx.metadata().table_by_name("PUBLIC", "PARENTS").is_none());
    assert!(matches!(
        tx.insert_record(parents, &[(parent_label, Value::text("x"))]),
        Err(TxnError::InvalidArg(_))
    ));
    tx.commit().expect("commit");
    assert!(db.current_metadata().table_by_name("PUBLIC", "CHILDREN").is_none());
}

#[test]
fn added_columns_take_the_next_position() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("items")).expect("create");
    let added = tx
        .add_column(table, &ColumnSpec::new("qty", ColumnType::Integer).default_value(Value::Integer(1)))
        .expect("add column");
    let position = tx.metadata().column(added).expect("column").position;
    assert_eq!(position, 2);
    let label = col(&tx, table, "label");
    tx.insert_record(table, &[(label, Value::text("x"))]).expect("insert");
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, added), vec![Value::Integer(1)]);
    assert!(matches!(
        tx.add_column(table, &ColumnSpec::new("must", ColumnType::Text).not_null()),
        Err(TxnError::InvalidArg(_))
    ));
}

#[test]
fn unique_index_rejects_duplicates() {
    let db = open();
    let mut tx = root(&db);
    let table = tx.create_table("PUBLIC", &keyed_table("codes")).expect("create");
    let label = col(&tx, table, "label");
    tx.create_index(table, "codes_label", &["label"], true).expect("index");
    tx.insert_record(table, &[(label, Value::text("A1"))]).expect("first");
    assert!(matches!(
        tx.insert_record(table, &[(label, Value::text("A1"))]),
        Err(TxnError::Constraint(_))
    ));
}

struct EvenOnly;

impl AccessHandler for EvenOnly {
    fn read_access(&self, _txn: TxnId, _table: TableId, row: &Row) -> bool {
        row.iter().any(|(_, v)| v.as_i64().is_some_and(|n| n % 2 == 0))
    }

    fn write_access(
        &self,
        _txn: TxnId,
        table: TableId,
        action: WriteAction,
        _old_row: Option<&Row>,
        new_row: Option<&Row>,
    ) -> Result<()> {
        let allowed = action != WriteAction::Delete && new_row.is_some_and(|row| self.read_access(0, table, row));
        if allowed {
            Ok(())
        } else {
            Err(TxnError::WriteAccessDenied {
                table: table.to_string(),
            })
        }
    }
}

#[test]
fn access_checked_tables_consult_their_handler() {
    let db = open();
    let mut tx = root(&db);
    let spec = TableSpec::new("vault")
        .column(ColumnSpec::new("id", ColumnType::Integer))
        .primary_key("id")
        .access_checked();
    let table = tx.create_table("PUBLIC", &spec).expect("create");
    let id = col(&tx, table, "id");
    assert!(matches!(
        tx.scan(&ScanRequest::new(table)),
        Err(TxnError::ReadAccessDenied { .. })
    ));
    db.register_access_handler(table, Arc::new(EvenOnly));

    tx.insert_record(table, &[(id, Value::Integer(2))]).expect("even row");
    tx.finish_command().expect("finish");
    assert!(matches!(
        tx.insert_record(table, &[(id, Value::Integer(3))]),
        Err(TxnError::WriteAccessDenied { .. })
    ));
    let (changed, _) = tx
        .update_record(table, None, &Row::new(), &[(id, Value::Integer(5))], false, true)
        .expect("handler skipped");
    assert!(changed);
    tx.finish_command().expect("finish");
    assert_eq!(values(&mut tx, table, id), vec![Value::Integer(2)]);
    assert!(db.unregister_access_handler(table));
}
