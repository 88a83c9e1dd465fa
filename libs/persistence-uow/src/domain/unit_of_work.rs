//! Unit of work over one or more entity contexts
//!
//! Contexts are opened lazily, one per data source name (case-insensitive),
//! and flushed together on commit. There is no rollback operation: dropping
//! an uncommitted unit of work discards its changes.
//!
//! Commit is NOT atomic across contexts. Each context flushes in its own
//! store transaction; if a later context fails, earlier ones stay durable.
//! The failure reports which contexts were already flushed.

use super::context::EntityContext;
use super::data_source::DataSources;
use super::repository::Repository;
use crate::contract::{Entity, PersistenceError, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    /// No context opened yet
    Created,
    /// At least one context participates
    Active,
    /// All contexts flushed
    Committed,
    /// A commit failed; the unit of work must be discarded
    Failed,
}

/// Groups entity contexts committed as one logical operation
pub struct UnitOfWork {
    sources: Arc<DataSources>,
    /// Lower-cased name and context, in the order contexts joined
    contexts: Vec<(String, EntityContext)>,
    state: UnitOfWorkState,
}

impl UnitOfWork {
    pub fn new(sources: Arc<DataSources>) -> Self {
        Self {
            sources,
            contexts: Vec::new(),
            state: UnitOfWorkState::Created,
        }
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Created | UnitOfWorkState::Active => Ok(()),
            UnitOfWorkState::Committed => Err(PersistenceError::InvalidOperation(
                "unit of work already committed".to_string(),
            )),
            UnitOfWorkState::Failed => Err(PersistenceError::InvalidOperation(
                "unit of work failed to commit and must be discarded".to_string(),
            )),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        let key = name.to_lowercase();
        self.contexts.iter().position(|(k, _)| *k == key)
    }

    /// Context for `name`, opened from the data sources on first use
    pub fn context(&mut self, name: &str) -> Result<&mut EntityContext> {
        self.ensure_open()?;
        let index = match self.position(name) {
            Some(index) => index,
            None => {
                let context = self.sources.open_context(name)?;
                self.contexts.push((name.to_lowercase(), context));
                self.state = UnitOfWorkState::Active;
                self.contexts.len() - 1
            }
        };
        Ok(&mut self.contexts[index].1)
    }

    /// Join an externally built context under its own name
    pub fn register_context(&mut self, context: EntityContext) -> Result<()> {
        self.ensure_open()?;
        if self.position(context.name()).is_some() {
            return Err(PersistenceError::InvalidOperation(format!(
                "context `{}` is already part of this unit of work",
                context.name()
            )));
        }
        self.contexts.push((context.name().to_lowercase(), context));
        self.state = UnitOfWorkState::Active;
        Ok(())
    }

    /// Repository for `E` bound to the context of `name`
    pub fn repository<E: Entity>(&mut self, name: &str) -> Result<Repository<'_, E>> {
        Ok(Repository::new(self.context(name)?))
    }

    /// Participating contexts in the order they joined
    pub fn active_contexts(&self) -> impl Iterator<Item = &EntityContext> {
        self.contexts.iter().map(|(_, context)| context)
    }

    /// Flush every context in join order, stopping at the first failure.
    ///
    /// Contexts before the failing one stay flushed; contexts after it are
    /// never flushed.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut flushed = Vec::new();
        for (_, context) in self.contexts.iter_mut() {
            match context.flush().await {
                Ok(affected) => {
                    tracing::debug!(context = %context.name(), affected, "Context flushed");
                    flushed.push(context.name().to_string());
                }
                Err(source) => {
                    tracing::warn!(
                        context = %context.name(),
                        already_flushed = ?flushed,
                        error = %source,
                        "Unit of work commit failed"
                    );
                    self.state = UnitOfWorkState::Failed;
                    return Err(commit_failed(context.name().to_string(), flushed, source));
                }
            }
        }
        self.state = UnitOfWorkState::Committed;
        tracing::info!(contexts = flushed.len(), "Unit of work committed");
        Ok(())
    }

    /// Flush every context concurrently and wait for all of them.
    ///
    /// A failing context does not stop the others. The first failure in join
    /// order is reported once everything has settled.
    pub async fn commit_concurrent(&mut self) -> Result<()> {
        self.ensure_open()?;
        let outcomes = join_all(self.contexts.iter_mut().map(|(_, context)| async move {
            let outcome = context.flush().await;
            (context.name().to_string(), outcome)
        }))
        .await;
        self.settle(outcomes)
    }

    /// [`commit`](Self::commit) that stops when `cancel` fires.
    ///
    /// The context being flushed when cancellation arrives and all later ones
    /// are left unflushed.
    pub async fn commit_with_cancel(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let mut flushed = Vec::new();
        for (_, context) in self.contexts.iter_mut() {
            if let Err(source) = context.flush_with_cancel(cancel).await {
                self.state = UnitOfWorkState::Failed;
                return Err(commit_failed(context.name().to_string(), flushed, source));
            }
            flushed.push(context.name().to_string());
        }
        self.state = UnitOfWorkState::Committed;
        Ok(())
    }

    /// [`commit_concurrent`](Self::commit_concurrent) that stops when `cancel` fires.
    ///
    /// Contexts that finished before cancellation stay flushed, the rest are
    /// left unflushed. Which ones finished first is not specified.
    pub async fn commit_concurrent_with_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let outcomes = join_all(self.contexts.iter_mut().map(|(_, context)| async move {
            let outcome = context.flush_with_cancel(cancel).await;
            (context.name().to_string(), outcome)
        }))
        .await;
        self.settle(outcomes)
    }

    fn settle(&mut self, outcomes: Vec<(String, Result<u64>)>) -> Result<()> {
        let mut flushed = Vec::new();
        let mut failure = None;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => flushed.push(name),
                Err(source) => {
                    tracing::warn!(context = %name, error = %source, "Context flush failed");
                    if source.is_durable() {
                        flushed.push(name.clone());
                    }
                    if failure.is_none() {
                        failure = Some((name, source));
                    }
                }
            }
        }

        match failure {
            Some((context, source)) => {
                self.state = UnitOfWorkState::Failed;
                Err(PersistenceError::CommitFailed {
                    context,
                    flushed,
                    source: Box::new(source),
                })
            }
            None => {
                self.state = UnitOfWorkState::Committed;
                tracing::info!(contexts = flushed.len(), "Unit of work committed concurrently");
                Ok(())
            }
        }
    }
}

/// Failure of `context`; a flush that committed before failing counts as flushed
fn commit_failed(
    context: String,
    mut flushed: Vec<String>,
    source: PersistenceError,
) -> PersistenceError {
    if source.is_durable() {
        flushed.push(context.clone());
    }
    PersistenceError::CommitFailed {
        context,
        flushed,
        source: Box::new(source),
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("contexts", &self.contexts.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}
