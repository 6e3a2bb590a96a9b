use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::Language;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scans")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub image_url: String,
    pub created_at: DateTimeUtc,
    pub language: Language,
    #[sea_orm(indexed)]
    pub user_id: String,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub analysis: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
