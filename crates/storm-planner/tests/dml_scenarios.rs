//! Sharded DML scenarios: autoincrement, consistent-lookup maintenance,
//! duplicate handling, and lookup-routed reads.

mod common;

use common::standard_cluster;
use storm_common::prelude::*;
use storm_sql::{Delete, Expr, Insert, Select, SelectExpr, Statement, TableName, TableRef};

fn insert_things(names: &[&str]) -> Statement {
    Statement::Insert(Insert {
        table: TableName::new("things"),
        columns: vec!["name".into()],
        rows: names.iter().map(|n| vec![Expr::lit(*n)]).collect(),
        ignore: false,
    })
}

fn select_things_by_name(name: &str) -> Statement {
    Statement::Select(Select {
        exprs: vec![
            SelectExpr::expr(Expr::col("id")),
            SelectExpr::expr(Expr::col("name")),
        ],
        from: vec![TableRef::named("things")],
        where_clause: Some(Expr::eq(Expr::col("name"), Expr::lit(name))),
        ..Default::default()
    })
}

fn all_things_rows(cluster: &common::TestCluster) -> Vec<Row> {
    let mut rows = Vec::new();
    cluster.each_tablet("ks", |tablet| {
        rows.extend(tablet.table_rows("things"));
    });
    rows
}

/// Autoincrement draws from the sequence table and reports
/// last_insert_id.
#[tokio::test]
async fn test_autoincrement_from_sequence() {
    let cluster = standard_cluster(&["-80", "80-"]);

    let first = cluster
        .exec(&insert_things(&["a"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(first.last_insert_id, 1);

    let second = cluster
        .exec(&insert_things(&["b"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(second.last_insert_id, 2);

    assert_eq!(all_things_rows(&cluster).len(), 2);
}

/// The owner insert also writes the lookup row, and a later read by the
/// lookup column routes through it to the owning shard.
#[tokio::test]
async fn test_lookup_routed_read_after_insert() {
    let cluster = standard_cluster(&["-80", "80-"]);
    cluster
        .exec(&insert_things(&["foo"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();

    // The lookup table holds exactly one mapping.
    let lookup_rows = cluster.tablet("lk", "0").table_rows("things_name_lookup");
    assert_eq!(lookup_rows.len(), 1);
    assert_eq!(lookup_rows[0].get_str(0), Some("foo"));

    let before: u64 = cluster.tablets.values().map(|t| t.queries.get()).sum();
    let result = cluster
        .exec(&select_things_by_name("foo"), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get_str(1), Some("foo"));

    // One lookup-table read plus one owner-shard read.
    let after: u64 = cluster.tablets.values().map(|t| t.queries.get()).sum();
    assert_eq!(after - before, 2);
}

/// Scenario: inserting a duplicate lookup value fails with AlreadyExists
/// and leaves exactly one owner row and one lookup row.
#[tokio::test]
async fn test_consistent_lookup_duplicate() {
    let cluster = standard_cluster(&["-80", "80-"]);
    cluster
        .exec(&insert_things(&["foo"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();

    let err = cluster
        .exec(&insert_things(&["foo"]), Some("ks"), &BindVars::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_, _)));

    // Exactly one of each row survives.
    let owners = all_things_rows(&cluster);
    assert_eq!(owners.len(), 1);
    let lookup_rows = cluster.tablet("lk", "0").table_rows("things_name_lookup");
    assert_eq!(lookup_rows.len(), 1);
}

/// A stale lookup entry left by a crashed transaction is reaped by the
/// next insert of the same value.
#[tokio::test]
async fn test_stale_lookup_entry_reaped() {
    let cluster = standard_cluster(&["-80", "80-"]);

    // Simulate a crashed prior attempt: the lookup row exists but no
    // owner row does.
    cluster.tablet("lk", "0").seed_row(
        "things_name_lookup",
        vec![Value::from("bar"), Value::Bytes(vec![0xde, 0xad])],
    );

    cluster
        .exec(&insert_things(&["bar"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();

    // The stale mapping was overwritten, not duplicated.
    let lookup_rows = cluster.tablet("lk", "0").table_rows("things_name_lookup");
    assert_eq!(lookup_rows.len(), 1);
    assert_ne!(
        lookup_rows[0].get(1),
        Some(&Value::Bytes(vec![0xde, 0xad]))
    );
    assert_eq!(all_things_rows(&cluster).len(), 1);
}

/// If the owner insert fails, the already-written lookup row is rolled
/// back.
#[tokio::test]
async fn test_owner_failure_rolls_back_lookup_row() {
    let cluster = standard_cluster(&["-80", "80-"]);
    cluster
        .exec(&insert_things(&["foo"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();

    // Force an owner-side duplicate: reuse the id of the existing row
    // with a fresh lookup value.
    let existing_id = all_things_rows(&cluster)[0].get_i64(0).unwrap();
    let stmt = Statement::Insert(Insert {
        table: TableName::new("things"),
        columns: vec!["id".into(), "name".into()],
        rows: vec![vec![Expr::lit(existing_id), Expr::lit("qux")]],
        ignore: false,
    });
    let err = cluster
        .exec(&stmt, Some("ks"), &BindVars::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_, _)));

    // The lookup row written ahead of the owner insert was removed.
    let lookup_rows = cluster.tablet("lk", "0").table_rows("things_name_lookup");
    assert_eq!(lookup_rows.len(), 1);
    assert_eq!(lookup_rows[0].get_str(0), Some("foo"));
}

/// Deleting an owner row also deletes its lookup mapping.
#[tokio::test]
async fn test_delete_cleans_lookup_rows() {
    let cluster = standard_cluster(&["-80", "80-"]);
    cluster
        .exec(&insert_things(&["foo", "bar"]), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(
        cluster.tablet("lk", "0").table_rows("things_name_lookup").len(),
        2
    );

    let delete = Statement::Delete(Delete {
        table: TableName::new("things"),
        where_clause: Some(Expr::eq(Expr::col("name"), Expr::lit("foo"))),
    });
    let result = cluster
        .exec(&delete, Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    let lookup_rows = cluster.tablet("lk", "0").table_rows("things_name_lookup");
    assert_eq!(lookup_rows.len(), 1);
    assert_eq!(lookup_rows[0].get_str(0), Some("bar"));
    assert_eq!(all_things_rows(&cluster).len(), 1);

    // The deleted name no longer resolves.
    let result = cluster
        .exec(&select_things_by_name("foo"), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert!(result.rows.is_empty());
}

/// INSERT IGNORE accumulates per-shard duplicates instead of failing.
#[tokio::test]
async fn test_insert_ignore_accumulates() {
    let cluster = standard_cluster(&["-80", "80-"]);
    let insert = |ignore| {
        Statement::Insert(Insert {
            table: TableName::new("t"),
            columns: vec!["id".into(), "x".into(), "y".into()],
            rows: vec![
                vec![Expr::lit(1), Expr::lit(0), Expr::lit(0)],
                vec![Expr::lit(2), Expr::lit(0), Expr::lit(0)],
            ],
            ignore,
        })
    };
    cluster
        .exec(&insert(false), Some("ks"), &BindVars::new())
        .await
        .unwrap();

    // Re-inserting with IGNORE succeeds and affects no rows.
    let result = cluster
        .exec(&insert(true), Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 0);
}

/// Updates must not touch vindex columns.
#[tokio::test]
async fn test_update_vindex_column_rejected() {
    let cluster = standard_cluster(&["-80", "80-"]);
    let stmt = Statement::Update(storm_sql::Update {
        table: TableName::new("things"),
        assignments: vec![("name".into(), Expr::lit("renamed"))],
        where_clause: Some(Expr::eq(Expr::col("id"), Expr::lit(1))),
    });
    let err = storm_planner::plan(&stmt, Some("ks"), &cluster.vschema).unwrap_err();
    assert_eq!(err.code(), Some("VT12001"));
}

/// A routed update modifies only the targeted rows.
#[tokio::test]
async fn test_routed_update() {
    let cluster = standard_cluster(&["-80", "80-"]);
    let insert = Statement::Insert(Insert {
        table: TableName::new("t"),
        columns: vec!["id".into(), "x".into(), "y".into()],
        rows: vec![
            vec![Expr::lit(1), Expr::lit(10), Expr::lit(0)],
            vec![Expr::lit(2), Expr::lit(20), Expr::lit(0)],
        ],
        ignore: false,
    });
    cluster
        .exec(&insert, Some("ks"), &BindVars::new())
        .await
        .unwrap();

    let update = Statement::Update(storm_sql::Update {
        table: TableName::new("t"),
        assignments: vec![("x".into(), Expr::lit(99))],
        where_clause: Some(Expr::eq(Expr::col("id"), Expr::lit(1))),
    });
    let result = cluster
        .exec(&update, Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    let check = Statement::Select(Select {
        exprs: vec![SelectExpr::expr(Expr::col("x"))],
        from: vec![TableRef::named("t")],
        where_clause: Some(Expr::eq(Expr::col("id"), Expr::lit(1))),
        ..Default::default()
    });
    let result = cluster
        .exec(&check, Some("ks"), &BindVars::new())
        .await
        .unwrap();
    assert_eq!(result.rows[0].get_i64(0), Some(99));
}
