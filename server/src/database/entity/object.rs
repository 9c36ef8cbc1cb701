//! A decrypted object held in the on-disk cache.

use sea_orm::entity::prelude::*;

pub type ObjectModel = Model;

/// A row of the disk-cache catalog.
///
/// One row per cached file. The invariant maintained by the reaper is
/// that the sum of `size_bytes` over all rows stays within the
/// configured quota.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "object")]
pub struct Model {
    /// Unique numeric ID of the object.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The content hash of the blob this object was derived from.
    ///
    /// 96-character lowercase hexadecimal.
    #[sea_orm(unique, indexed)]
    pub hash: String,

    /// Size of the file on disk.
    pub size_bytes: i64,

    /// Timestamp of the last read, used by the reaper to evict the
    /// least recently accessed objects first.
    #[sea_orm(indexed)]
    pub last_access: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
