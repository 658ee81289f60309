use std::env;

use sluice::{params, prelude::*, Pool};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), sluice::BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match env::var("DATABASE_URL") {
        Ok(url) => {
            let db = PgDatabase::connect(&url).await?;
            demo(&db).await?;
        }
        Err(_) => {
            info!("DATABASE_URL not set, running against the in-memory backend");
            let db = Database::new(MemoryPool::new());
            demo(&db).await?;
        }
    }

    Ok(())
}

async fn demo<P: Pool>(db: &Database<P>) -> Result<(), sluice::BoxError> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS heroes (name TEXT, power INT)",
        &[],
    )
    .await?;
    db.execute("DELETE FROM heroes", &[]).await?;

    db.run_transaction_async(|tx| {
        Box::pin(async move {
            for (name, power) in [("Legolas", 1357), ("Aragorn", 87), ("Gimli", 139)] {
                tx.execute(
                    "INSERT INTO heroes (name, power) VALUES ($1, $2)",
                    &params![name, power],
                )
                .await?;
            }
            Ok(())
        })
    })
    .await?;
    info!("committed three heroes");

    let rolled_back = db
        .run_transaction_async(|tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO heroes (name, power) VALUES ($1, $2)",
                    &params!["Boromir", 100],
                )
                .await?;
                Err("changed our minds".into())
            })
        })
        .await;
    if let Err(error) = rolled_back {
        info!(state = %error.state(), "rolled back as expected: {error}");
    }

    let mut rows = db
        .query_stream("SELECT * FROM heroes ORDER BY name", params!())
        .await?;
    while let Some(row) = rows.try_next().await? {
        info!(
            name = row.column("name").and_then(sluice::Value::as_str).unwrap_or(""),
            power = row.column("power").and_then(sluice::Value::as_i64).unwrap_or(0),
            "hero"
        );
    }

    Ok(())
}
