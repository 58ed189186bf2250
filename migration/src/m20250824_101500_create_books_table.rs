use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Books::Table)
                    .if_not_exists()
                    .col(pk_auto(Books::Id))
                    .col(string(Books::UserId))
                    .col(string(Books::Identifier))
                    .col(string(Books::IdentifierType))
                    .col(string(Books::Title))
                    .col(string_null(Books::Author))
                    .col(string_null(Books::EditionId))
                    .col(double_null(Books::ProgressPercent))
                    .col(integer_null(Books::StatusId))
                    .col(string_null(Books::StartedAt))
                    .col(string_null(Books::FinishedAt))
                    .col(timestamp(Books::LastSync))
                    .col(timestamp(Books::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // One row per (user, identifier, identifier_type, title).
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .unique()
                    .name("idx_books_identity")
                    .table(Books::Table)
                    .col(Books::UserId)
                    .col(Books::Identifier)
                    .col(Books::IdentifierType)
                    .col(Books::Title)
                    .to_owned(),
            )
            .await?;

        for (name, col) in [
            ("idx_books_user_id", Books::UserId),
            ("idx_books_identifier", Books::Identifier),
            ("idx_books_identifier_type", Books::IdentifierType),
            ("idx_books_title", Books::Title),
            ("idx_books_edition_id", Books::EditionId),
            ("idx_books_author", Books::Author),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(Books::Table)
                        .col(col)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Books::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum Books {
    Table,
    Id,
    UserId,
    Identifier,
    IdentifierType,
    Title,
    Author,
    EditionId,
    ProgressPercent,
    StatusId,
    StartedAt,
    FinishedAt,
    LastSync,
    UpdatedAt,
}
