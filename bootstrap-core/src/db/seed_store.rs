use super::DbPool;
use crate::command::ManageCommand;
use crate::seed::{AdminAccount, CreateResult, Department, SeedRecord, SeedStore, ADMIN_ROLE};
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Seed records stored in the application's Postgres tables.
///
/// Departments are written directly. The administrator is created through the
/// application's `createsuperuser` command so the application keeps ownership
/// of its password-hash format.
pub struct PgSeedStore {
    pool: DbPool,
    manage: ManageCommand,
}

impl PgSeedStore {
    pub fn new(pool: DbPool, manage: ManageCommand) -> Self {
        Self { pool, manage }
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checking for user '{}'", username))
    }

    async fn department_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM departments WHERE name = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checking for department '{}'", name))
    }

    async fn insert_department(&self, department: &Department) -> Result<CreateResult> {
        let result = sqlx::query(
            r#"
            INSERT INTO departments
                (name, description, floor_number, phone_extension, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, NOW(), NOW())
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&department.name)
        .bind(&department.description)
        .bind(department.floor_number)
        .bind(&department.phone_extension)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting department '{}'", department.name))?;

        Ok(if result.rows_affected() == 0 {
            CreateResult::AlreadyPresent
        } else {
            CreateResult::Created
        })
    }

    async fn create_superuser(&self, account: &AdminAccount) -> Result<CreateResult> {
        let args = vec![
            "createsuperuser".to_string(),
            "--noinput".to_string(),
            "--username".to_string(),
            account.username.clone(),
            "--email".to_string(),
            account.email.clone(),
        ];
        let envs = [
            ("DJANGO_SUPERUSER_USERNAME", account.username.as_str()),
            ("DJANGO_SUPERUSER_EMAIL", account.email.as_str()),
            ("DJANGO_SUPERUSER_PASSWORD", account.password.as_str()),
        ];

        match self.manage.run(&args, &envs).await {
            Ok(_) => {
                self.grant_admin_role(&account.username).await?;
                Ok(CreateResult::Created)
            }
            // createsuperuser refuses a taken username; tell that apart from a real failure.
            Err(e) => {
                if self.user_exists(&account.username).await? {
                    Ok(CreateResult::AlreadyPresent)
                } else {
                    Err(e.context(format!("creating administrator '{}'", account.username)))
                }
            }
        }
    }
}

impl PgSeedStore {
    /// `createsuperuser` leaves the application role at its default; the
    /// API's admin-only endpoints check `role`. Only runs for an account
    /// this bootstrap just created.
    async fn grant_admin_role(&self, username: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET role = $1 WHERE username = $2")
            .bind(ADMIN_ROLE)
            .bind(username)
            .execute(&self.pool)
            .await
            .with_context(|| format!("granting '{}' role to '{}'", ADMIN_ROLE, username))?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user '{}' missing after createsuperuser", username);
        }
        Ok(())
    }
}

#[async_trait]
impl SeedStore for PgSeedStore {
    async fn exists(&self, record: &SeedRecord) -> Result<bool> {
        match record {
            SeedRecord::AdminAccount(account) => self.user_exists(&account.username).await,
            SeedRecord::Department(department) => self.department_exists(&department.name).await,
        }
    }

    async fn create(&self, record: &SeedRecord) -> Result<CreateResult> {
        match record {
            SeedRecord::AdminAccount(account) => self.create_superuser(account).await,
            SeedRecord::Department(department) => self.insert_department(department).await,
        }
    }
}
