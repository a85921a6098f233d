use sqlx::SqlitePool;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    crate::db::connect_in_memory()
        .await
        .expect("Failed to create in-memory database")
}
