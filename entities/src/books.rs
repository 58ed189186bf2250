//! Cached sync state, one row per (user, identifier, identifier_type, title).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "books")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: String,
    /// ISBN, ASIN, or derived title+author key, normalized.
    pub identifier: String,
    pub identifier_type: String,
    /// Lower-cased, trimmed. Part of the unique key.
    pub title: String,
    pub author: Option<String>,
    /// Catalog-side edition reference, stored as text.
    pub edition_id: Option<String>,
    pub progress_percent: Option<f64>,
    /// 1 = Want to Read, 2 = Currently Reading, 3 = Read.
    /// None means no signal, never Want to Read.
    pub status_id: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_sync: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
