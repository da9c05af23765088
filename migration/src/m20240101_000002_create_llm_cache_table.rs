use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LlmCache::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LlmCache::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LlmCache::RequestHash)
                            .char_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(LlmCache::RequestId).string_len(255))
                    .col(ColumnDef::new(LlmCache::Request).json_binary().not_null())
                    .col(
                        ColumnDef::new(LlmCache::ModelName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(LlmCache::Temperature).float())
                    .col(ColumnDef::new(LlmCache::MaxTokens).integer())
                    .col(ColumnDef::new(LlmCache::Response).json_binary().not_null())
                    .col(ColumnDef::new(LlmCache::TotalTokens).integer())
                    .col(ColumnDef::new(LlmCache::PromptTokens).integer())
                    .col(ColumnDef::new(LlmCache::CompletionTokens).integer())
                    .col(ColumnDef::new(LlmCache::StartTime).timestamp())
                    .col(ColumnDef::new(LlmCache::EndTime).timestamp())
                    .col(ColumnDef::new(LlmCache::DurationMs).big_integer())
                    .col(
                        ColumnDef::new(LlmCache::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(LlmCache::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(LlmCache::ExpireAt).timestamp())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LlmCache::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LlmCache {
    Table,
    Id,
    RequestHash,
    RequestId,
    Request,
    ModelName,
    Temperature,
    MaxTokens,
    Response,
    TotalTokens,
    PromptTokens,
    CompletionTokens,
    StartTime,
    EndTime,
    DurationMs,
    CreatedAt,
    UpdatedAt,
    ExpireAt,
}
