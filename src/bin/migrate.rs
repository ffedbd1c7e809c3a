use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://labtasker.db".to_string());

    println!("running database migrations for: {database_url}");

    let pool: Pool<Sqlite> = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    if !Sqlite::database_exists(&database_url).await? {
        println!("database does not exist, creating...");
        Sqlite::create_database(&database_url).await?;
    }

    println!("applying pending migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    println!("migrations completed");

    Ok(())
}
