use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Derived tables, replaced wholesale on every compile
        manager
            .create_table(
                Table::create()
                    .table(Roles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Roles::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Roles::ResourceType))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Permissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Permissions::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Permissions::ResourceType))
                    .col(string(Permissions::Name))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_permissions_type_name")
                    .table(Permissions::Table)
                    .col(Permissions::ResourceType)
                    .col(Permissions::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RolePermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RolePermissions::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(RolePermissions::Role))
                    .col(integer(RolePermissions::PermissionId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_permissions_role")
                            .from(RolePermissions::Table, RolePermissions::Role)
                            .to(Roles::Table, Roles::Name),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_permissions_permission")
                            .from(RolePermissions::Table, RolePermissions::PermissionId)
                            .to(Permissions::Table, Permissions::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RoleImplications::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RoleImplications::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(RoleImplications::FromRole))
                    .col(string(RoleImplications::ToRole))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_implications_from")
                            .from(RoleImplications::Table, RoleImplications::FromRole)
                            .to(Roles::Table, Roles::Name),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_role_implications_to")
                            .from(RoleImplications::Table, RoleImplications::ToRole)
                            .to(Roles::Table, Roles::Name),
                    )
                    .to_owned(),
            )
            .await?;

        // Assignments survive recompilation. The role column is checked against
        // the derived `roles` table by the synchronizer, not by a foreign key,
        // because the derived rows are deleted and re-inserted on every compile.
        manager
            .create_table(
                Table::create()
                    .table(UserRoles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserRoles::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(UserRoles::UserId))
                    .col(string(UserRoles::ResourceType))
                    .col(string(UserRoles::ResourceId))
                    .col(string(UserRoles::Role))
                    .col(big_integer(UserRoles::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_roles_unique")
                    .table(UserRoles::Table)
                    .col(UserRoles::UserId)
                    .col(UserRoles::ResourceType)
                    .col(UserRoles::ResourceId)
                    .col(UserRoles::Role)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_roles_resource")
                    .table(UserRoles::Table)
                    .col(UserRoles::ResourceType)
                    .col(UserRoles::ResourceId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserRoles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RoleImplications::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RolePermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Permissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Roles::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Roles {
    Table,
    Name,
    ResourceType,
}

#[derive(DeriveIden)]
enum Permissions {
    Table,
    Id,
    ResourceType,
    Name,
}

#[derive(DeriveIden)]
enum RolePermissions {
    Table,
    Id,
    Role,
    PermissionId,
}

#[derive(DeriveIden)]
enum RoleImplications {
    Table,
    Id,
    FromRole,
    ToRole,
}

#[derive(DeriveIden)]
enum UserRoles {
    Table,
    Id,
    UserId,
    ResourceType,
    ResourceId,
    Role,
    CreatedAt,
}
