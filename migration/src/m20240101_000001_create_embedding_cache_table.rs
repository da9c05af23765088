use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EmbeddingCache::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmbeddingCache::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(EmbeddingCache::InputHash)
                            .char_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EmbeddingCache::InputText).text().not_null())
                    .col(
                        ColumnDef::new(EmbeddingCache::ModelName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmbeddingCache::Embedding)
                            .array(ColumnType::Double)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EmbeddingCache::RequestId).string_len(255))
                    .col(ColumnDef::new(EmbeddingCache::TokenCount).integer())
                    .col(ColumnDef::new(EmbeddingCache::Dimensions).integer())
                    .col(ColumnDef::new(EmbeddingCache::StartTime).timestamp())
                    .col(ColumnDef::new(EmbeddingCache::EndTime).timestamp())
                    .col(ColumnDef::new(EmbeddingCache::DurationMs).big_integer())
                    .col(
                        ColumnDef::new(EmbeddingCache::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EmbeddingCache::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(EmbeddingCache::ExpireAt).timestamp())
                    .to_owned(),
            )
            .await?;

        // (input_hash, model_name) 唯一，upsert 冲突目标
        manager
            .create_index(
                Index::create()
                    .name("uq_embedding_cache_input_hash_model_name")
                    .table(EmbeddingCache::Table)
                    .col(EmbeddingCache::InputHash)
                    .col(EmbeddingCache::ModelName)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmbeddingCache::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EmbeddingCache {
    Table,
    Id,
    InputHash,
    InputText,
    ModelName,
    Embedding,
    RequestId,
    TokenCount,
    Dimensions,
    StartTime,
    EndTime,
    DurationMs,
    CreatedAt,
    UpdatedAt,
    ExpireAt,
}
