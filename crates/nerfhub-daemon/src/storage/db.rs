//! Database connection and initialization.

pub use nerfhub_core::db::DatabaseError;

nerfhub_core::define_database!(Database, "Coordination store migrations complete");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn reopening_a_file_reruns_migrations_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");
        assert!(Database::open(&path).await.is_ok());
        assert!(Database::open(&path).await.is_ok());
    }
}
