mod common;

use pg_ledger::sql::Value;
use pg_ledger::{deserialize_changeset, Error, Executor};
use std::time::Duration;

// Run with: cargo test --test db_test -- --ignored --test-threads=1
// Needs a PostgreSQL 16 superuser and wal_level=logical (see TEST_PG_* in common).

#[tokio::test]
#[ignore]
async fn test_sequence_increases_per_commit() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_seq_test").await;
    let db = common::open_db().await;

    let mut ids = Vec::new();
    for i in 0..3i64 {
        let tx = db.begin_tx().await.unwrap();
        tx.execute(
            "INSERT INTO ds_seq_test.accounts (id, owner) VALUES ($1, $2)",
            &[Value::Int(i), Value::from("owner")],
        )
        .await
        .unwrap();
        ids.push(tx.commit().await.unwrap().unwrap());
    }

    assert!(ids.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert_ne!(ids[0].hash, ids[1].hash);
    assert_eq!(db.last_commit_id().await, Some(ids[2]));

    // Commit IDs are strictly increasing across reopen.
    db.close().await.unwrap();
    let db = common::open_db().await;
    let tx = db.begin_tx().await.unwrap();
    let next = tx.commit().await.unwrap().unwrap();
    assert_eq!(next.seq, ids[2].seq + 1);
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_same_statements_produce_same_hash() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    let db = common::open_db().await;

    let mut hashes = Vec::new();
    for _ in 0..2 {
        common::reset_schema(&client, "ds_hash_test").await;
        let tx = db.begin_tx().await.unwrap();
        tx.execute("INSERT INTO ds_hash_test.accounts VALUES (1, 'a'), (2, 'b')", &[])
            .await
            .unwrap();
        tx.execute("UPDATE ds_hash_test.accounts SET owner = 'c' WHERE id = 2", &[])
            .await
            .unwrap();
        tx.execute("DELETE FROM ds_hash_test.accounts WHERE id = 1", &[])
            .await
            .unwrap();
        hashes.push(tx.commit().await.unwrap().unwrap().hash);
    }
    assert_eq!(hashes[0], hashes[1]);
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_savepoint_failure_keeps_outer_transaction() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_sp_test").await;
    let db = common::open_db().await;

    let mut tx = db.begin_tx().await.unwrap();
    tx.execute("INSERT INTO ds_sp_test.accounts VALUES (1, 'a')", &[])
        .await
        .unwrap();
    {
        let inner = tx.begin_tx().await.unwrap();
        assert_eq!(inner.depth(), 1);
        let dup = inner
            .execute("INSERT INTO ds_sp_test.accounts VALUES (1, 'dup')", &[])
            .await;
        assert!(matches!(dup, Err(Error::Postgres(_))));
        inner.rollback().await.unwrap();
    }
    {
        let inner = tx.begin_tx().await.unwrap();
        inner
            .execute("INSERT INTO ds_sp_test.accounts VALUES (2, 'b')", &[])
            .await
            .unwrap();
        assert_eq!(inner.commit().await.unwrap(), None);
    }
    let pending = tx
        .query("SELECT count(*) FROM ds_sp_test.accounts", &[])
        .await
        .unwrap();
    assert_eq!(pending.scalar().unwrap(), &Value::Int(2));
    tx.commit().await.unwrap().unwrap();

    let changeset = db.last_changeset().await.unwrap();
    let group = deserialize_changeset(&changeset).unwrap();
    assert_eq!(group.changesets.len(), 1);
    assert_eq!(group.changesets[0].inserts.len(), 2);

    let committed = db
        .query("SELECT owner FROM ds_sp_test.accounts ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(
        committed.rows,
        vec![vec![Value::from("a")], vec![Value::from("b")]]
    );
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_single_writer_and_auto_commit() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_auto_test").await;
    let db = common::open_db().await;

    let insert = "INSERT INTO ds_auto_test.accounts VALUES (1, 'a')";
    assert!(matches!(db.execute(insert, &[]).await, Err(Error::NoTransaction)));

    let tx = db.begin_tx().await.unwrap();
    assert!(matches!(db.begin_tx().await, Err(Error::TransactionExists)));
    assert!(matches!(db.set_auto_commit(true).await, Err(Error::TransactionExists)));
    tx.rollback().await.unwrap();

    db.set_auto_commit(true).await.unwrap();
    assert!(matches!(db.begin_tx().await, Err(Error::AutoCommit)));
    let before = db.last_commit_id().await;
    db.execute(insert, &[]).await.unwrap();
    let after = db.last_commit_id().await.unwrap();
    assert!(before.map_or(true, |b| after.seq > b.seq));

    // A failed auto-commit statement leaves no transaction behind.
    assert!(db.execute(insert, &[]).await.is_err());
    db.set_auto_commit(false).await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_dropped_transaction_rolls_back() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_drop_test").await;
    let db = common::open_db().await;

    {
        let tx = db.begin_tx().await.unwrap();
        tx.execute("INSERT INTO ds_drop_test.accounts VALUES (1, 'a')", &[])
            .await
            .unwrap();
    }

    let tx = db.begin_tx().await.unwrap();
    let rows = tx
        .query("SELECT count(*) FROM ds_drop_test.accounts", &[])
        .await
        .unwrap();
    assert_eq!(rows.scalar().unwrap(), &Value::Int(0));
    tx.rollback().await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_untracked_commits_are_ignored() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_untracked_test").await;
    let db = common::open_db().await;

    client
        .batch_execute("INSERT INTO ds_untracked_test.accounts VALUES (100, 'outside')")
        .await
        .unwrap();

    let tx = db.begin_tx().await.unwrap();
    tx.execute("INSERT INTO ds_untracked_test.accounts VALUES (1, 'a')", &[])
        .await
        .unwrap();
    let id = tokio::time::timeout(Duration::from_secs(10), tx.commit())
        .await
        .expect("commit id")
        .unwrap()
        .unwrap();
    assert!(id.seq > 0);

    let group = deserialize_changeset(&db.last_changeset().await.unwrap()).unwrap();
    let inserted = group.changesets[0].decode_tuple(&group.changesets[0].inserts[0]).unwrap();
    assert_eq!(inserted[0], Some(Value::Int(1)));
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_kv_and_cancelled_commit_wait() {
    common::init_tracing();
    let _serial = common::serial().await;
    let db = common::open_db().await;

    let tx = db.begin_tx().await.unwrap();
    tx.kv_set(b"height", b"\x00\x01").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(db.kv_get(b"height").await.unwrap(), Some(vec![0, 1]));
    assert_eq!(db.kv_get(b"missing").await.unwrap(), None);

    // An already-completed cancel future abandons the wait, not the commit.
    let tx = db.begin_tx().await.unwrap();
    tx.kv_delete(b"height").await.unwrap();
    let result = tx.commit_until(std::future::ready(())).await;
    assert!(matches!(result, Err(Error::CommitUnconfirmed) | Ok(Some(_))));
    assert_eq!(db.kv_get(b"height").await.unwrap(), None);

    assert!(db.err().is_none());
    db.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_query_pending_without_transaction_cannot_write() {
    common::init_tracing();
    let _serial = common::serial().await;
    let client = common::raw_client().await;
    common::reset_schema(&client, "ds_pending_test").await;
    let db = common::open_db().await;

    // No open transaction: the statement runs read-only on the read pool.
    let write = db
        .query_pending("INSERT INTO ds_pending_test.accounts VALUES (1, 'a') RETURNING id", &[])
        .await;
    assert!(matches!(write, Err(Error::Postgres(_))));
    let rows = client
        .query_one("SELECT count(*) FROM ds_pending_test.accounts", &[])
        .await
        .unwrap();
    assert_eq!(rows.get::<_, i64>(0), 0);

    let read = db
        .query_pending("SELECT count(*) FROM ds_pending_test.accounts", &[])
        .await
        .unwrap();
    assert_eq!(read.scalar().unwrap(), &Value::Int(0));

    // Inside a transaction it sees uncommitted writes on the writer.
    let tx = db.begin_tx().await.unwrap();
    tx.execute("INSERT INTO ds_pending_test.accounts VALUES (2, 'b')", &[])
        .await
        .unwrap();
    let pending = db
        .query_pending("SELECT count(*) FROM ds_pending_test.accounts", &[])
        .await
        .unwrap();
    assert_eq!(pending.scalar().unwrap(), &Value::Int(1));
    tx.rollback().await.unwrap();
    db.close().await.unwrap();
}
