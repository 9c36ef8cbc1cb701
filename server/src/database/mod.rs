//! The disk-cache catalog.
//!
//! A single-table SQLite database tracking which decrypted objects are
//! on disk, how large they are and when they were last read. The files
//! themselves are the source of truth for reads; the catalog exists so
//! the reaper can account for total size and pick eviction victims
//! without enumerating directories.

pub mod entity;
pub mod migration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::query::QuerySelect;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult,
    QueryFilter, QueryOrder,
};

use entity::object::{self, Entity as Object, ObjectModel};
use strand::blob::BlobHash;

#[derive(Debug, FromQueryResult)]
struct TotalBytes {
    total: Option<i64>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Records a cached object, updating the row if the hash is
    /// already present.
    async fn record_object(&self, hash: &BlobHash, size_bytes: u64) -> Result<(), DbErr>;

    /// Bumps the last accessed timestamp of an object.
    async fn touch_object(&self, hash: &BlobHash) -> Result<(), DbErr>;

    /// Removes an object row.
    async fn forget_object(&self, hash: &str) -> Result<(), DbErr>;

    /// Returns whether a hash is catalogued.
    async fn contains_object(&self, hash: &BlobHash) -> Result<bool, DbErr>;

    /// Total size of all catalogued objects.
    async fn total_bytes(&self) -> Result<u64, DbErr>;

    /// The least recently accessed objects, oldest first.
    async fn least_recently_accessed(&self, limit: u64) -> Result<Vec<ObjectModel>, DbErr>;

    /// All catalogued hashes, used by the startup orphan sweep.
    async fn all_hashes(&self) -> Result<Vec<String>, DbErr>;
}

#[async_trait]
impl Catalog for DatabaseConnection {
    async fn record_object(&self, hash: &BlobHash, size_bytes: u64) -> Result<(), DbErr> {
        let row = object::ActiveModel {
            hash: Set(hash.as_str().to_owned()),
            size_bytes: Set(size_bytes as i64),
            last_access: Set(Utc::now()),
            ..Default::default()
        };

        Object::insert(row)
            .on_conflict(
                OnConflict::column(object::Column::Hash)
                    .update_columns([object::Column::SizeBytes, object::Column::LastAccess])
                    .to_owned(),
            )
            .exec(self)
            .await?;

        Ok(())
    }

    async fn touch_object(&self, hash: &BlobHash) -> Result<(), DbErr> {
        Object::update_many()
            .col_expr(object::Column::LastAccess, Expr::value(Utc::now()))
            .filter(object::Column::Hash.eq(hash.as_str()))
            .exec(self)
            .await?;

        Ok(())
    }

    async fn forget_object(&self, hash: &str) -> Result<(), DbErr> {
        Object::delete_many()
            .filter(object::Column::Hash.eq(hash))
            .exec(self)
            .await?;

        Ok(())
    }

    async fn contains_object(&self, hash: &BlobHash) -> Result<bool, DbErr> {
        let found = Object::find()
            .filter(object::Column::Hash.eq(hash.as_str()))
            .one(self)
            .await?;

        Ok(found.is_some())
    }

    async fn total_bytes(&self) -> Result<u64, DbErr> {
        let total = Object::find()
            .select_only()
            .column_as(object::Column::SizeBytes.sum(), "total")
            .into_model::<TotalBytes>()
            .one(self)
            .await?
            .and_then(|row| row.total)
            .unwrap_or(0);

        Ok(total.max(0) as u64)
    }

    async fn least_recently_accessed(&self, limit: u64) -> Result<Vec<ObjectModel>, DbErr> {
        Object::find()
            .order_by_asc(object::Column::LastAccess)
            .limit(limit)
            .all(self)
            .await
    }

    async fn all_hashes(&self) -> Result<Vec<String>, DbErr> {
        let rows = Object::find().all(self).await?;
        Ok(rows.into_iter().map(|row| row.hash).collect())
    }
}
