//! Per-store migration ledger: forward apply, integrity checks and rollback

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::MigrationCatalog;
use crate::db::ControlDb;
use crate::error::{Error, Result};
use crate::models::{MigrationApplication, StoreId};
use crate::store::StoreAdapter;
use crate::sync::LockManager;
use crate::util::now_millis;

/// One catalog step as seen from one store's ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepStatus {
    pub version: u32,
    pub name: String,
    pub destructive: bool,
    pub reversible: bool,
    pub applied_at: Option<i64>,
    /// `Some(false)` when the recorded checksum no longer matches the catalog
    pub checksum_matches: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    pub store: StoreId,
    /// Highest applied version, zero if none
    pub current_version: u32,
    pub halted: Option<String>,
    pub steps: Vec<StepStatus>,
}

impl LedgerStatus {
    pub fn pending(&self) -> impl Iterator<Item = &StepStatus> {
        self.steps.iter().filter(|step| step.applied_at.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRollback {
    pub version: u32,
    pub name: String,
    pub destructive: bool,
    pub reversible: bool,
}

/// Steps a rollback would undo, in execution (descending) order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackPlan {
    pub store: StoreId,
    pub target: u32,
    pub steps: Vec<PlannedRollback>,
}

impl RollbackPlan {
    pub fn destructive_versions(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|step| step.destructive)
            .map(|step| step.version)
            .collect()
    }

    pub fn is_destructive(&self) -> bool {
        self.steps.iter().any(|step| step.destructive)
    }
}

/// Applies and reverts catalog steps independently on each store.
pub struct MigrationLedger {
    catalog: MigrationCatalog,
    control: ControlDb,
    locks: Arc<LockManager>,
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
}

impl MigrationLedger {
    pub fn new(
        catalog: MigrationCatalog,
        control: ControlDb,
        locks: Arc<LockManager>,
        primary: Arc<dyn StoreAdapter>,
        secondary: Arc<dyn StoreAdapter>,
    ) -> Self {
        Self {
            catalog,
            control,
            locks,
            primary,
            secondary,
        }
    }

    pub const fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    fn store(&self, store: StoreId) -> &dyn StoreAdapter {
        match store {
            StoreId::Primary => self.primary.as_ref(),
            StoreId::Secondary => self.secondary.as_ref(),
        }
    }

    pub async fn status(&self, store: StoreId) -> Result<LedgerStatus> {
        let applied: BTreeMap<u32, MigrationApplication> = self
            .control
            .applications(store)
            .await?
            .into_iter()
            .map(|application| (application.version, application))
            .collect();
        let steps = self
            .catalog
            .steps()
            .map(|step| {
                let application = applied.get(&step.version);
                StepStatus {
                    version: step.version,
                    name: step.name.clone(),
                    destructive: step.destructive,
                    reversible: step.is_reversible(),
                    applied_at: application.map(|application| application.applied_at),
                    checksum_matches: application
                        .map(|application| application.checksum == step.checksum),
                }
            })
            .collect();
        Ok(LedgerStatus {
            store,
            current_version: applied.keys().next_back().copied().unwrap_or(0),
            halted: self.control.halt_reason(store).await?,
            steps,
        })
    }

    /// Compare every recorded application with the catalog.
    ///
    /// A mismatch halts further migrations on the store.
    pub async fn verify(&self, store: StoreId) -> Result<()> {
        for application in self.control.applications(store).await? {
            let problem = match self.catalog.get(application.version) {
                None => Some(format!(
                    "v{} is recorded as applied but missing from the catalog",
                    application.version
                )),
                Some(step) if step.checksum != application.checksum => Some(format!(
                    "v{} ({}) changed after it was applied: recorded {}, now {}",
                    step.version, step.name, application.checksum, step.checksum
                )),
                Some(_) => None,
            };
            if let Some(message) = problem {
                self.control
                    .halt_migrations(store, &message, now_millis())
                    .await?;
                tracing::error!(store = %store, version = application.version, "{message}");
                return Err(Error::Integrity { store, message });
            }
        }
        Ok(())
    }

    async fn ensure_not_halted(&self, store: StoreId) -> Result<()> {
        match self.control.halt_reason(store).await? {
            Some(reason) => Err(Error::MigrationHalted { store, reason }),
            None => Ok(()),
        }
    }

    /// Apply every missing step up to `target` (latest when `None`), lowest first.
    ///
    /// Holds the global lock exclusively, so no sync batch or queue drain
    /// runs while scripts execute.
    pub async fn apply_forward(
        &self,
        store: StoreId,
        target: Option<u32>,
    ) -> Result<Vec<MigrationApplication>> {
        let target = target.unwrap_or_else(|| self.catalog.latest_version());
        if target > self.catalog.latest_version() {
            return Err(Error::InvalidInput(format!(
                "target v{target} is beyond the latest known migration v{}",
                self.catalog.latest_version()
            )));
        }

        let _exclusive = self.locks.exclusive().await;
        self.ensure_not_halted(store).await?;
        self.verify(store).await?;

        let applied: Vec<u32> = self
            .control
            .applications(store)
            .await?
            .into_iter()
            .map(|application| application.version)
            .collect();
        let adapter = self.store(store);
        let mut recorded = Vec::new();
        for step in self
            .catalog
            .steps()
            .filter(|step| step.version <= target && !applied.contains(&step.version))
        {
            adapter.apply_migration_step(&step.up_script).await?;
            let application = MigrationApplication {
                version: step.version,
                store,
                applied_at: now_millis(),
                checksum: step.checksum.clone(),
            };
            self.control.record_application(&application).await?;
            tracing::info!(store = %store, version = step.version, name = %step.name, "Migration applied");
            recorded.push(application);
        }
        Ok(recorded)
    }

    /// Steps a rollback to `target` would undo; nothing is executed
    pub async fn rollback_plan(&self, store: StoreId, target: u32) -> Result<RollbackPlan> {
        let mut applied: Vec<u32> = self
            .control
            .applications(store)
            .await?
            .into_iter()
            .map(|application| application.version)
            .filter(|version| *version > target)
            .collect();
        applied.sort_unstable_by(|a, b| b.cmp(a));

        let steps = applied
            .into_iter()
            .map(|version| {
                let step = self.catalog.get(version);
                PlannedRollback {
                    version,
                    name: step.map(|step| step.name.clone()).unwrap_or_default(),
                    destructive: step.is_some_and(|step| step.destructive),
                    reversible: step.is_some_and(|step| step.is_reversible()),
                }
            })
            .collect();
        Ok(RollbackPlan {
            store,
            target,
            steps,
        })
    }

    /// Run down-scripts in descending order down to, and excluding, `target`.
    ///
    /// Refuses plans containing destructive steps unless
    /// `accept_destructive` is set, and plans containing a step without a
    /// down-script.
    pub async fn rollback(
        &self,
        store: StoreId,
        target: u32,
        accept_destructive: bool,
    ) -> Result<RollbackPlan> {
        let _exclusive = self.locks.exclusive().await;
        self.ensure_not_halted(store).await?;
        self.verify(store).await?;

        let plan = self.rollback_plan(store, target).await?;
        if let Some(step) = plan.steps.iter().find(|step| !step.reversible) {
            return Err(Error::IrreversibleStep(step.version));
        }
        if plan.is_destructive() && !accept_destructive {
            return Err(Error::DestructiveRollback {
                versions: plan.destructive_versions(),
            });
        }

        let adapter = self.store(store);
        for planned in &plan.steps {
            let Some(down) = self
                .catalog
                .get(planned.version)
                .and_then(|step| step.down_script.as_deref())
            else {
                return Err(Error::IrreversibleStep(planned.version));
            };
            adapter.apply_migration_step(down).await?;
            self.control.remove_application(store, planned.version).await?;
            tracing::info!(
                store = %store,
                version = planned.version,
                destructive = planned.destructive,
                "Migration rolled back"
            );
        }
        Ok(plan)
    }

    /// Lift an integrity halt after operator intervention
    pub async fn clear_halt(&self, store: StoreId) -> Result<bool> {
        let cleared = self.control.clear_halt(store).await?;
        if cleared {
            tracing::warn!(store = %store, "Migration halt cleared by operator");
        }
        Ok(cleared)
    }
}
