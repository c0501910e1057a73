//! Ensure-exists seeding of the administrator account and reference data.
//!
//! Every record is keyed by a natural key. A record that already exists is
//! left untouched, so seeding can run on every bootstrap rather than only on
//! the first one.

use crate::error::SeedError;
use crate::steps::StepAction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A hospital department (reference data), keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub floor_number: i32,
    #[serde(default)]
    pub phone_extension: String,
}

impl Department {
    pub fn new(name: &str, description: &str, floor_number: i32, phone_extension: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            floor_number,
            phone_extension: phone_extension.to_string(),
        }
    }

    /// The departments every fresh deployment starts with.
    pub fn defaults() -> Vec<Department> {
        vec![
            Department::new("General Medicine", "Primary care and internal medicine", 1, "1100"),
            Department::new("Emergency", "Emergency and trauma care", 0, "1000"),
            Department::new("Cardiology", "Heart and cardiovascular care", 3, "1300"),
            Department::new("Neurology", "Brain and nervous system care", 4, "1400"),
            Department::new("Orthopedics", "Bone, joint and muscle care", 2, "1200"),
            Department::new("Pediatrics", "Care for infants, children and adolescents", 5, "1500"),
        ]
    }
}

/// Application role that unlocks the admin-only API.
pub const ADMIN_ROLE: &str = "admin";

/// The administrative account, keyed by `username`.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    /// The password is the built-in fallback rather than an operator value.
    pub fallback_password: bool,
}

impl fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("fallback_password", &self.fallback_password)
            .finish()
    }
}

/// Declarative desired-state entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedRecord {
    AdminAccount(AdminAccount),
    Department(Department),
}

impl SeedRecord {
    pub fn domain(&self) -> &'static str {
        match self {
            SeedRecord::AdminAccount(_) => "admin account",
            SeedRecord::Department(_) => "department",
        }
    }

    /// The natural unique key.
    pub fn key(&self) -> &str {
        match self {
            SeedRecord::AdminAccount(account) => &account.username,
            SeedRecord::Department(department) => &department.name,
        }
    }
}

/// Result of `SeedStore::create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateResult {
    Created,
    /// The store found the key already present at insert time.
    AlreadyPresent,
}

/// Where seed records live.
#[async_trait]
pub trait SeedStore: Send + Sync {
    async fn exists(&self, record: &SeedRecord) -> anyhow::Result<bool>;

    async fn create(&self, record: &SeedRecord) -> anyhow::Result<CreateResult>;
}

#[derive(Debug)]
pub enum SeedStatus {
    Created,
    AlreadyExists,
    Failed(SeedError),
}

#[derive(Debug)]
pub struct SeedOutcome {
    pub domain: &'static str,
    pub key: String,
    pub status: SeedStatus,
    /// A credential-rotation warning was logged for this record.
    pub rotation_warned: bool,
}

impl SeedOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, SeedStatus::Failed(_))
    }
}

pub struct Seeder {
    store: Arc<dyn SeedStore>,
}

impl Seeder {
    pub fn new(store: Arc<dyn SeedStore>) -> Self {
        Self { store }
    }

    /// Apply each record independently. One failing record never stops the
    /// rest from being attempted.
    pub async fn seed(&self, records: &[SeedRecord]) -> Vec<SeedOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let status = match self.ensure(record).await {
                Ok(status) => status,
                Err(e) => SeedStatus::Failed(e),
            };
            let rotation_warned = log_outcome(record, &status);
            outcomes.push(SeedOutcome {
                domain: record.domain(),
                key: record.key().to_string(),
                status,
                rotation_warned,
            });
        }
        outcomes
    }

    async fn ensure(&self, record: &SeedRecord) -> Result<SeedStatus, SeedError> {
        if self.store.exists(record).await? {
            return Ok(SeedStatus::AlreadyExists);
        }
        match self.store.create(record).await? {
            CreateResult::Created => Ok(SeedStatus::Created),
            CreateResult::AlreadyPresent => Err(SeedError::Conflict {
                domain: record.domain(),
                key: record.key().to_string(),
            }),
        }
    }
}

/// Returns true when a credential-rotation warning was emitted.
fn log_outcome(record: &SeedRecord, status: &SeedStatus) -> bool {
    let domain = record.domain();
    let key = record.key();
    match status {
        SeedStatus::Created => {
            info!(domain, key, "✅ created");
            if let SeedRecord::AdminAccount(account) = record {
                warn_default_credential(account);
                return true;
            }
        }
        SeedStatus::AlreadyExists => info!(domain, key, "already exists, left untouched"),
        SeedStatus::Failed(e @ SeedError::Conflict { .. }) => {
            error!(domain, key, "seed invariant violated: {}", e)
        }
        SeedStatus::Failed(e) => warn!(domain, key, "seeding failed: {}", e),
    }
    false
}

fn warn_default_credential(account: &AdminAccount) {
    warn!(
        username = %account.username,
        "🔐 SECURITY: administrator account '{}' was created by bootstrap seeding with a default credential. \
         Rotate this password immediately; a seeded credential is never production-safe.",
        account.username
    );
    if account.fallback_password {
        warn!(
            username = %account.username,
            "🔐 SECURITY: ADMIN_PASSWORD was not set, the built-in fallback password is in use. \
             Anyone who has read this project's defaults can log in as '{}'.",
            account.username
        );
    }
}

/// Summarize outcomes as a step result: an error when any record failed.
fn step_result(domain: &str, outcomes: &[SeedOutcome]) -> anyhow::Result<Option<String>> {
    let created = outcomes
        .iter()
        .filter(|o| matches!(o.status, SeedStatus::Created))
        .count();
    let existing = outcomes
        .iter()
        .filter(|o| matches!(o.status, SeedStatus::AlreadyExists))
        .count();
    let failed: Vec<String> = outcomes
        .iter()
        .filter_map(|o| match &o.status {
            SeedStatus::Failed(e) => Some(format!("'{}': {}", o.key, e)),
            _ => None,
        })
        .collect();

    if !failed.is_empty() {
        anyhow::bail!(
            "{} of {} {} record(s) failed ({} created, {} already existed): {}",
            failed.len(),
            outcomes.len(),
            domain,
            created,
            existing,
            failed.join("; ")
        );
    }
    Ok(Some(format!("{} created, {} already existed", created, existing)))
}

/// Step action: ensure the administrator account exists.
pub struct SeedAdminAction {
    seeder: Seeder,
    account: AdminAccount,
}

impl SeedAdminAction {
    pub fn new(store: Arc<dyn SeedStore>, account: AdminAccount) -> Self {
        Self {
            seeder: Seeder::new(store),
            account,
        }
    }
}

#[async_trait]
impl StepAction for SeedAdminAction {
    async fn run(&self) -> anyhow::Result<Option<String>> {
        let records = [SeedRecord::AdminAccount(self.account.clone())];
        let outcomes = self.seeder.seed(&records).await;
        step_result("admin account", &outcomes)
    }
}

/// Step action: ensure every configured department exists.
pub struct SeedDepartmentsAction {
    seeder: Seeder,
    departments: Vec<Department>,
}

impl SeedDepartmentsAction {
    pub fn new(store: Arc<dyn SeedStore>, departments: Vec<Department>) -> Self {
        Self {
            seeder: Seeder::new(store),
            departments,
        }
    }
}

#[async_trait]
impl StepAction for SeedDepartmentsAction {
    async fn run(&self) -> anyhow::Result<Option<String>> {
        let records: Vec<SeedRecord> = self
            .departments
            .iter()
            .cloned()
            .map(SeedRecord::Department)
            .collect();
        let outcomes = self.seeder.seed(&records).await;
        step_result("department", &outcomes)
    }
}
