pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    // Statement logging is noisy at info; keep it behind RUST_LOG=sqlx=debug.
    opts.sqlx_logging(false);
    Database::connect(opts).await
}
