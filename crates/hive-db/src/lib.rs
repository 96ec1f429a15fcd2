pub use sea_orm;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    // SQLite serializes writers anyway; a single connection avoids busy errors.
    if database_url.starts_with("sqlite:") {
        opts.max_connections(1).min_connections(1);
    }
    Database::connect(opts).await
}
