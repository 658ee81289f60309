use sluice::{params, Database, DriverError, MemoryPool, Pool, TxState, Value};

async fn sample_db() -> (MemoryPool, Database<MemoryPool>) {
    let pool = MemoryPool::new();
    let db = Database::new(pool.clone());
    db.execute("CREATE TABLE sample_test_table (name, age)", &[])
        .await
        .expect("Failed to create table");
    (pool, db)
}

#[tokio::test]
async fn successful_work_commits_and_releases_once() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();

    //* When
    db.run_transaction_async(|tx| {
        Box::pin(async move {
            tx.execute(
                "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                &params!["john doe", 27],
            )
            .await?;
            tx.execute(
                "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                &params!["jane doe", 25],
            )
            .await?;
            Ok(())
        })
    })
    .await
    .expect("Transaction should commit");

    //* Then
    let after = pool.counts();
    assert_eq!(after.begin_calls - before.begin_calls, 1);
    assert_eq!(after.commit_calls - before.commit_calls, 1);
    assert_eq!(after.releases - before.releases, 1);
    assert_eq!(after.rollback_calls, before.rollback_calls);
    assert_eq!(after.destroys, before.destroys);
    assert_eq!(pool.active(), 0, "Connection not returned to the pool");

    let rows = db
        .fetch_all("SELECT * FROM sample_test_table ORDER BY name", &[])
        .await
        .expect("Failed to read back rows");
    let names: Vec<_> = rows
        .iter()
        .map(|row| row.column("name").and_then(Value::as_str).unwrap_or(""))
        .collect();
    assert_eq!(names, ["jane doe", "john doe"]);
}

#[tokio::test]
async fn failing_work_rolls_back_and_surfaces_the_original_error() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();

    //* When
    let error = db
        .run_transaction_async(|tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                    &params!["john doe", 27],
                )
                .await?;
                Err("ERR_SIMULATE".into())
            })
        })
        .await
        .expect_err("Transaction should fail");

    //* Then
    assert_eq!(error.original().to_string(), "ERR_SIMULATE");
    assert_eq!(
        error.state(),
        TxState {
            started: true,
            committed: false,
            reverted: true,
        }
    );

    let after = pool.counts();
    assert_eq!(after.rollback_calls - before.rollback_calls, 1);
    assert_eq!(after.releases - before.releases, 1);
    assert_eq!(after.destroys, before.destroys);
    assert_eq!(pool.active(), 0, "Connection not returned to the pool");

    let rows = db
        .fetch_all("SELECT * FROM sample_test_table", &[])
        .await
        .expect("Failed to read back rows");
    assert!(rows.is_empty(), "Rollback should have removed the insert");
}

#[tokio::test]
async fn rollback_failure_destroys_the_connection() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();
    pool.fail_next_rollback();

    //* When
    let error = db
        .run_transaction_async(|tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                    &params!["john doe", 27],
                )
                .await?;
                Err("ERR_SIMULATE".into())
            })
        })
        .await
        .expect_err("Transaction should fail");

    //* Then
    // The rollback error is secondary: logged, never the surfaced cause.
    assert_eq!(error.original().to_string(), "ERR_SIMULATE");
    assert_eq!(
        error.state(),
        TxState {
            started: true,
            committed: false,
            reverted: false,
        }
    );

    let after = pool.counts();
    assert_eq!(after.rollback_calls - before.rollback_calls, 1);
    assert_eq!(after.destroys - before.destroys, 1);
    assert_eq!(
        after.releases, before.releases,
        "A poisoned connection must not re-enter the pool"
    );
    assert_eq!(pool.active(), 0, "Connection still counted as active");
}

#[tokio::test]
async fn destroy_failure_is_swallowed_and_the_original_error_survives() {
    //* Given
    let (pool, db) = sample_db().await;
    pool.fail_next_rollback();
    pool.fail_next_destroy();

    //* When
    let error = db
        .run_transaction_async(|tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                    &params!["john doe", 27],
                )
                .await?;
                Err("ERR_SIMULATE".into())
            })
        })
        .await
        .expect_err("Transaction should fail");

    //* Then
    assert_eq!(error.original().to_string(), "ERR_SIMULATE");
    assert_eq!(pool.counts().destroys, 1);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn commit_failure_takes_the_rollback_branch() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();
    pool.fail_next_commit();

    //* When
    let error = db
        .run_transaction_async(|tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                    &params!["john doe", 27],
                )
                .await?;
                Ok(())
            })
        })
        .await
        .expect_err("Commit should fail");

    //* Then
    let driver_error = error
        .original()
        .downcast_ref::<DriverError>()
        .expect("Original cause should be the commit error");
    assert_eq!(driver_error.code(), Some("40001"));
    assert_eq!(
        error.state(),
        TxState {
            started: true,
            committed: false,
            reverted: true,
        }
    );

    let after = pool.counts();
    assert_eq!(after.commit_calls - before.commit_calls, 1);
    assert_eq!(after.rollback_calls - before.rollback_calls, 1);
    assert_eq!(pool.active(), 0);

    let rows = db
        .fetch_all("SELECT * FROM sample_test_table", &[])
        .await
        .expect("Failed to read back rows");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn begin_failure_surfaces_unstarted_and_releases_the_connection() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();
    pool.fail_next_begin();

    //* When
    let error = db
        .run_transaction_async(|_tx| Box::pin(async move { Ok(()) }))
        .await
        .expect_err("Begin should fail");

    //* Then
    assert_eq!(error.state(), TxState::default());

    let after = pool.counts();
    assert_eq!(after.begin_calls - before.begin_calls, 1);
    assert_eq!(after.rollback_calls, before.rollback_calls);
    assert_eq!(after.releases - before.releases, 1);
    assert_eq!(pool.active(), 0, "Begin failure must not leak the connection");
}

#[tokio::test]
async fn acquire_failure_surfaces_without_any_cleanup() {
    //* Given
    let (pool, db) = sample_db().await;
    let before = pool.counts();
    pool.fail_next_acquire();

    //* When
    let error = db
        .run_transaction_async(|_tx| Box::pin(async move { Ok(()) }))
        .await
        .expect_err("Acquire should fail");

    //* Then
    assert_eq!(error.state(), TxState::default());

    let after = pool.counts();
    assert_eq!(after.acquires, before.acquires);
    assert_eq!(after.begin_calls, before.begin_calls);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn callback_variant_delivers_the_outcome() {
    //* Given
    let (pool, db) = sample_db().await;

    //* When
    let mut delivered = None;
    db.run_transaction(
        |tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO sample_test_table (name, age) VALUES ($1, $2)",
                    &params!["john doe", 27],
                )
                .await?;
                Ok(())
            })
        },
        |result| delivered = Some(result),
    )
    .await;

    //* Then
    assert!(matches!(delivered, Some(Ok(()))));
    assert_eq!(pool.active(), 0);

    //* When the work fails, the callback receives the wrapped error
    let mut delivered = None;
    db.run_transaction(
        |_tx| Box::pin(async move { Err("ERR_SIMULATE".into()) }),
        |result| delivered = Some(result),
    )
    .await;

    //* Then
    let error = delivered
        .expect("Callback was not invoked")
        .expect_err("Transaction should fail");
    assert_eq!(error.original().to_string(), "ERR_SIMULATE");
    assert!(error.state().started);
    assert!(error.state().reverted);
}
