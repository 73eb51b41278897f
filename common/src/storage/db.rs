use std::ops::Deref;

use include_dir::{include_dir, Dir};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::{debug, info};

use crate::error::AppError;

use super::types::StoredObject;

/// Forward-only migrations, embedded at compile time. Files are named
/// `NNN_<name>.up.surql` and applied in lexicographic order; the matching
/// `.down.surql` files are shipped for operators but never run automatically.
static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/migrations");

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Applies every embedded `*.up.surql` file that has not been recorded in
    /// the `migration` table yet, in file-name order.
    pub async fn apply_migrations(&self) -> Result<(), AppError> {
        let mut files: Vec<_> = MIGRATIONS_DIR
            .files()
            .filter(|file| {
                file.path()
                    .to_str()
                    .is_some_and(|name| name.ends_with(".up.surql"))
            })
            .collect();
        files.sort_by_key(|file| file.path().to_path_buf());

        for file in files {
            let name = file
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".up.surql"))
                .ok_or_else(|| {
                    AppError::InternalError("malformed migration file name".to_string())
                })?
                .to_string();

            if self.migration_applied(&name).await? {
                debug!(migration = %name, "migration already applied");
                continue;
            }

            let sql = file.contents_utf8().ok_or_else(|| {
                AppError::InternalError(format!("migration {name} is not valid utf-8"))
            })?;

            self.client
                .query(sql)
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(AppError::Database)?;

            self.client
                .query("CREATE type::thing('migration', $name) SET name = $name, applied_at = time::now();")
                .bind(("name", name.clone()))
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(AppError::Database)?;

            info!(migration = %name, "applied migration");
        }

        Ok(())
    }

    async fn migration_applied(&self, name: &str) -> Result<bool, AppError> {
        let mut response = self
            .client
            .query("SELECT VALUE name FROM migration WHERE name = $name;")
            .bind(("name", name.to_owned()))
            .await
            .map_err(AppError::Database)?;

        let found: Vec<String> = response.take(0).unwrap_or_default();
        Ok(!found.is_empty())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to retrieve all objects from a certain table, requires the struct to implement StoredObject
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing. Single connection,
    /// which sidesteps concurrent-write anomalies in the mem engine.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
