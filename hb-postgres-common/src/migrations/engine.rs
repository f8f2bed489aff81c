//! # MigrationEngine
//!
//! Reconciles a declared, ordered list of migrations against the ledger of
//! already-applied migrations: applies pending work, detects drift, and
//! orchestrates reverts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument};

use crate::error::SqlError;
use crate::gateway::PgGateway;

use super::descriptor::MigrationDescriptor;
use super::ledger;

/// Stable error identifiers for migration reconciliation failures.
#[derive(Error, Debug, Clone)]
pub enum MigrationError {
    #[error("group `{group}` declares duplicate migration names: {names:?}")]
    DuplicateNames { group: String, names: Vec<String> },

    #[error("dry run detected {count} pending migration(s) to apply")]
    RequiresChanges { count: usize },

    #[error(
        "applied migrations in group `{group}` diverge from the declared list at position {position}"
    )]
    AppliedMigrationsInconsistent { group: String, position: usize },

    #[error("no descriptor registered to revert `{name}` in group `{group}`")]
    CannotRevertMigration { group: String, name: String },

    #[error("database error: {0}")]
    Sql(Arc<SqlError>),
}

impl From<SqlError> for MigrationError {
    fn from(error: SqlError) -> Self {
        MigrationError::Sql(Arc::new(error))
    }
}

type Key = (String, String);

fn key_of(descriptor: &dyn MigrationDescriptor) -> Key {
    (descriptor.group().to_owned(), descriptor.name().to_owned())
}

/// The engine's lifecycle state, mirrored into a `tokio::sync::watch` channel so
/// any number of `wait_until_completed` callers are resumed in bulk on transition.
#[derive(Clone)]
enum EngineState {
    Waiting,
    Completed,
    Failed(MigrationError),
}

/// An applied migration reverted (or, in a dry run, planned to be reverted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertedEntry {
    pub group: String,
    pub name: String,
}

pub struct MigrationEngine {
    gateway: PgGateway,
    declared: Mutex<Vec<Arc<dyn MigrationDescriptor>>>,
    registered: Mutex<HashMap<Key, Arc<dyn MigrationDescriptor>>>,
    /// Single-writer discipline: exactly one `apply`/`revert` may run at a time.
    write_lock: Mutex<()>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl MigrationEngine {
    pub fn new(gateway: PgGateway) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Waiting);
        Self {
            gateway,
            declared: Mutex::new(Vec::new()),
            registered: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            state_tx,
            state_rx,
        }
    }

    /// Append `migration` to the declared list. Order matters: it is the order in
    /// which migrations are applied and the order the ledger's prefix is checked
    /// against.
    pub async fn add(&self, migration: impl MigrationDescriptor + 'static) {
        self.declared.lock().await.push(Arc::new(migration));
    }

    /// Record `migration` only in the revert dictionary keyed by `(group, name)`.
    /// It is never applied by this process; it exists so a divergent tail
    /// containing this migration can still be reverted.
    pub async fn register(&self, migration: impl MigrationDescriptor + 'static) {
        let descriptor: Arc<dyn MigrationDescriptor> = Arc::new(migration);
        self.registered
            .lock()
            .await
            .insert(key_of(descriptor.as_ref()), descriptor);
    }

    /// Suspend until the most recent `apply` reaches `completed` or `failed`.
    pub async fn wait_until_completed(&self) -> Result<(), MigrationError> {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let state = rx.borrow();
                match &*state {
                    EngineState::Completed => return Ok(()),
                    EngineState::Failed(error) => return Err(error.clone()),
                    EngineState::Waiting => {}
                }
            }
            rx.changed()
                .await
                .expect("MigrationEngine dropped while awaiters were pending");
        }
    }

    /// Reconcile the declared list against the ledger.
    #[instrument(skip(self))]
    pub async fn apply(&self, groups: Option<Vec<String>>, dry_run: bool) -> Result<(), MigrationError> {
        let _write_guard = self.write_lock.lock().await;

        if !dry_run {
            let _ = self.state_tx.send(EngineState::Waiting);
        }

        let start_time = Instant::now();
        let result = self.apply_inner(groups, dry_run).await;
        metrics::histogram!("migration_apply_duration_seconds").record(start_time.elapsed().as_secs_f64());

        if !dry_run {
            match &result {
                Ok(()) => {
                    let _ = self.state_tx.send(EngineState::Completed);
                }
                Err(error) => {
                    let _ = self.state_tx.send(EngineState::Failed(error.clone()));
                }
            }
        }

        result
    }

    async fn apply_inner(&self, groups: Option<Vec<String>>, dry_run: bool) -> Result<(), MigrationError> {
        let declared = self.declared.lock().await.clone();

        check_no_duplicate_names(&declared)?;

        let mut conn = self
            .gateway
            .pool()
            .acquire()
            .await
            .map_err(|error| SqlError::ConnectionError { error })?;
        ledger::ensure_table(&mut *conn).await?;
        let applied = ledger::list_ordered(&mut *conn).await?;
        drop(conn);

        let group_order = resolve_groups(groups, &declared, &applied);

        let mut planned: Vec<(String, Arc<dyn MigrationDescriptor>)> = Vec::new();

        for group in &group_order {
            let group_declared: Vec<&Arc<dyn MigrationDescriptor>> = declared
                .iter()
                .filter(|m| m.group() == group)
                .collect();
            let group_applied: Vec<&ledger::AppliedMigration> = applied
                .iter()
                .filter(|m| m.group == *group)
                .collect();

            let declared_names: Vec<&str> = group_declared.iter().map(|m| m.name()).collect();
            let applied_names: Vec<&str> = group_applied.iter().map(|m| m.name.as_str()).collect();

            let prefix_len = longest_common_prefix(&declared_names, &applied_names);

            if prefix_len < applied_names.len() {
                log_inconsistency_diff(group, &declared_names, &applied_names, prefix_len);
                return Err(MigrationError::AppliedMigrationsInconsistent {
                    group: group.clone(),
                    position: prefix_len,
                });
            }

            for descriptor in &group_declared[prefix_len..] {
                planned.push((group.clone(), Arc::clone(descriptor)));
            }
        }

        if dry_run {
            return if planned.is_empty() {
                Ok(())
            } else {
                Err(MigrationError::RequiresChanges {
                    count: planned.len(),
                })
            };
        }

        if planned.is_empty() {
            return Ok(());
        }

        self.gateway
            .with_transaction(|txn| {
                let planned = &planned;
                Box::pin(async move {
                    for (group, descriptor) in planned {
                        descriptor
                            .apply(&mut **txn)
                            .await
                            .map_err(|error| SqlError::query("MIGRATION APPLY", error))?;
                        ledger::insert(&mut **txn, descriptor.name(), group).await?;
                        info!(group = %group, name = descriptor.name(), "applied migration");
                    }
                    Ok::<(), SqlError>(())
                })
            })
            .await?;

        Ok(())
    }

    /// Revert every applied migration in reverse insertion order.
    pub async fn revert(
        &self,
        groups: Option<Vec<String>>,
        dry_run: bool,
    ) -> Result<Vec<RevertedEntry>, MigrationError> {
        let _write_guard = self.write_lock.lock().await;
        let start_time = Instant::now();
        let result = self.revert_tail(groups, dry_run, TailSelector::Full).await;
        metrics::histogram!("migration_revert_duration_seconds").record(start_time.elapsed().as_secs_f64());
        result
    }

    /// Revert only the divergent tail beyond the common prefix with the declared list.
    pub async fn revert_inconsistent(
        &self,
        groups: Option<Vec<String>>,
        dry_run: bool,
    ) -> Result<Vec<RevertedEntry>, MigrationError> {
        let _write_guard = self.write_lock.lock().await;
        let start_time = Instant::now();
        let result = self
            .revert_tail(groups, dry_run, TailSelector::InconsistentOnly)
            .await;
        metrics::histogram!("migration_revert_duration_seconds").record(start_time.elapsed().as_secs_f64());
        result
    }

    async fn revert_tail(
        &self,
        groups: Option<Vec<String>>,
        dry_run: bool,
        selector: TailSelector,
    ) -> Result<Vec<RevertedEntry>, MigrationError> {
        let declared = self.declared.lock().await.clone();
        let registered = self.registered.lock().await.clone();

        let mut lookup = registered;
        for descriptor in &declared {
            lookup
                .entry(key_of(descriptor.as_ref()))
                .or_insert_with(|| Arc::clone(descriptor));
        }

        let mut conn = self
            .gateway
            .pool()
            .acquire()
            .await
            .map_err(|error| SqlError::ConnectionError { error })?;
        let applied = ledger::list_ordered(&mut *conn).await?;
        drop(conn);

        let group_order = resolve_groups(groups, &declared, &applied);

        let mut to_revert: Vec<(String, String, Arc<dyn MigrationDescriptor>)> = Vec::new();

        for group in &group_order {
            let group_applied: Vec<&ledger::AppliedMigration> = applied
                .iter()
                .filter(|m| m.group == *group)
                .collect();

            let start = match selector {
                TailSelector::Full => 0,
                TailSelector::InconsistentOnly => {
                    let group_declared_names: Vec<&str> = declared
                        .iter()
                        .filter(|m| m.group() == group)
                        .map(|m| m.name())
                        .collect();
                    let applied_names: Vec<&str> =
                        group_applied.iter().map(|m| m.name.as_str()).collect();
                    longest_common_prefix(&group_declared_names, &applied_names)
                }
            };

            for applied_migration in group_applied[start..].iter().rev() {
                let key = (group.clone(), applied_migration.name.clone());
                let descriptor = lookup.get(&key).cloned().ok_or_else(|| {
                    MigrationError::CannotRevertMigration {
                        group: group.clone(),
                        name: applied_migration.name.clone(),
                    }
                })?;
                to_revert.push((group.clone(), applied_migration.name.clone(), descriptor));
            }
        }

        let entries: Vec<RevertedEntry> = to_revert
            .iter()
            .map(|(group, name, _)| RevertedEntry {
                group: group.clone(),
                name: name.clone(),
            })
            .collect();

        if dry_run || to_revert.is_empty() {
            return Ok(entries);
        }

        self.gateway
            .with_transaction(|txn| {
                let to_revert = &to_revert;
                Box::pin(async move {
                    for (group, name, descriptor) in to_revert {
                        descriptor
                            .revert(&mut **txn)
                            .await
                            .map_err(|error| SqlError::query("MIGRATION REVERT", error))?;
                        ledger::delete_by_name(&mut **txn, name, group).await?;
                        info!(group = %group, name = %name, "reverted migration");
                    }
                    Ok::<(), SqlError>(())
                })
            })
            .await?;

        Ok(entries)
    }
}

enum TailSelector {
    Full,
    InconsistentOnly,
}

fn check_no_duplicate_names(declared: &[Arc<dyn MigrationDescriptor>]) -> Result<(), MigrationError> {
    let mut by_group: HashMap<&str, HashMap<&str, usize>> = HashMap::new();

    for descriptor in declared {
        let counts = by_group.entry(descriptor.group()).or_default();
        *counts.entry(descriptor.name()).or_insert(0) += 1;
    }

    for (group, counts) in &by_group {
        let duplicates: Vec<String> = counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(name, _)| (*name).to_owned())
            .collect();

        if !duplicates.is_empty() {
            return Err(MigrationError::DuplicateNames {
                group: (*group).to_owned(),
                names: duplicates,
            });
        }
    }

    Ok(())
}

/// Resolve the set of groups to reconcile: the caller-supplied list if non-empty,
/// else the unique sequence obtained by concatenating declared groups then applied
/// groups and dropping later duplicates (first-seen order).
fn resolve_groups(
    groups: Option<Vec<String>>,
    declared: &[Arc<dyn MigrationDescriptor>],
    applied: &[ledger::AppliedMigration],
) -> Vec<String> {
    if let Some(groups) = groups {
        if !groups.is_empty() {
            return groups;
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut order = Vec::new();

    for descriptor in declared {
        if seen.insert(descriptor.group().to_owned()) {
            order.push(descriptor.group().to_owned());
        }
    }
    for migration in applied {
        if seen.insert(migration.group.clone()) {
            order.push(migration.group.clone());
        }
    }

    order
}

/// Longest common prefix length by position-wise name comparison.
fn longest_common_prefix(declared_names: &[&str], applied_names: &[&str]) -> usize {
    declared_names
        .iter()
        .zip(applied_names.iter())
        .take_while(|(d, a)| d == a)
        .count()
}

fn log_inconsistency_diff(group: &str, declared_names: &[&str], applied_names: &[&str], prefix_len: usize) {
    error!(group, prefix_len, "applied migrations diverge from declared list");
    let max_len = declared_names.len().max(applied_names.len());
    for i in prefix_len..max_len {
        let declared = declared_names.get(i).copied().unwrap_or("<none>");
        let applied = applied_names.get(i).copied().unwrap_or("<none>");
        error!(position = i, declared, applied, "migration diff");
    }
}
