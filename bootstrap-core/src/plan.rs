//! The fixed, ordered list of provisioning steps for the hospital service.
//!
//! Order is a correctness requirement: schema migration runs before anything
//! that reads or writes schema-dependent data.

use crate::command::{CommandAction, ManageCommand};
use crate::config::Config;
use crate::db::{CacheTableAction, ClearSessionsAction, DbPool, SqlxMigrateAction};
use crate::seed::{AdminAccount, SeedAdminAction, SeedDepartmentsAction, SeedStore};
use crate::steps::ProvisioningStep;
use std::sync::Arc;

pub const MIGRATE: &str = "migrate";
pub const COLLECTSTATIC: &str = "collectstatic";
pub const CACHE_TABLE: &str = "createcachetable";
pub const SEED_ADMIN: &str = "seed-admin";
pub const SEED_DEPARTMENTS: &str = "seed-departments";
pub const COMPRESS: &str = "compress";
pub const CLEAR_SESSIONS: &str = "clearsessions";
pub const SCHEMA_EXPORT: &str = "schema-export";
pub const SECURITY_AUDIT: &str = "security-audit";

/// Everything the steps need to touch the outside world.
pub struct PlanDeps {
    pub pool: DbPool,
    pub manage: ManageCommand,
    pub seed_store: Arc<dyn SeedStore>,
}

pub fn provisioning_steps(config: &Config, deps: PlanDeps) -> Vec<ProvisioningStep> {
    let PlanDeps {
        pool,
        manage,
        seed_store,
    } = deps;
    let steps_config = &config.steps;

    let migrate = match &steps_config.migrations_dir {
        Some(dir) => ProvisioningStep::fatal(MIGRATE, SqlxMigrateAction::new(pool.clone(), dir.clone())),
        None => ProvisioningStep::fatal(MIGRATE, CommandAction::new(manage.clone(), &["migrate", "--noinput"])),
    };

    let (password, fallback_password) = config.admin_password();
    let admin = AdminAccount {
        username: config.seed.admin_username.clone(),
        email: config.seed.admin_email.clone(),
        password,
        fallback_password,
    };

    let schema_path = steps_config.schema_export_path.to_string_lossy().into_owned();

    vec![
        migrate,
        ProvisioningStep::new(
            COLLECTSTATIC,
            steps_config.collectstatic_policy,
            CommandAction::new(manage.clone(), &["collectstatic", "--noinput"]),
        ),
        ProvisioningStep::tolerated(CACHE_TABLE, CacheTableAction::new(pool.clone(), steps_config.cache_table.clone())),
        ProvisioningStep::new(
            SEED_ADMIN,
            config.seed.admin_policy,
            SeedAdminAction::new(seed_store.clone(), admin),
        ),
        ProvisioningStep::tolerated(
            SEED_DEPARTMENTS,
            SeedDepartmentsAction::new(seed_store, config.seed.departments.clone()),
        )
        .enabled(config.seed.seed_departments),
        ProvisioningStep::tolerated(COMPRESS, CommandAction::new(manage.clone(), &["compress", "--force"]))
            .enabled(steps_config.enable_compress),
        ProvisioningStep::tolerated(CLEAR_SESSIONS, ClearSessionsAction::new(pool))
            .enabled(steps_config.enable_clear_sessions),
        ProvisioningStep::tolerated(
            SCHEMA_EXPORT,
            CommandAction::new(manage.clone(), &["spectacular", "--file", schema_path.as_str()]),
        )
        .enabled(steps_config.enable_schema_export),
        ProvisioningStep::tolerated(SECURITY_AUDIT, CommandAction::new(manage, &["check", "--deploy"]))
            .enabled(steps_config.enable_security_audit),
    ]
}
