//! Plans, procedures and the executor that runs them.
//!
//! A [`Plan`] inspects current state and produces the ordered list of
//! [`Procedure`]s still needed to converge it. The [`Executor`] runs that list
//! in order and aborts at the first failure. Plans are rebuilt from scratch on
//! every attempt and nothing is rolled back, so every procedure must be safe
//! to run again after a partial failure.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// One idempotent step of a plan.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Procedure name, used in logs and errors.
    fn name(&self) -> &str;

    /// Perform the step.
    ///
    /// A non-empty result replaces the remainder of the list being executed:
    /// the executor continues with the returned procedures and does not come
    /// back to the siblings that followed this one.
    async fn run(&self) -> anyhow::Result<Vec<Box<dyn Procedure>>>;
}

/// Builds the procedures that converge one resource.
#[async_trait]
pub trait Plan: Send + Sync {
    /// Plan name, used in logs and errors.
    fn name(&self) -> &str;

    /// Probe current state and return the procedures still required.
    async fn create(&self) -> anyhow::Result<Vec<Box<dyn Procedure>>>;
}

/// Errors from executing a plan.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The plan could not be built.
    #[error("plan {plan}: failed to build procedures")]
    Build {
        plan: String,
        #[source]
        source: anyhow::Error,
    },

    /// A procedure failed; the remaining procedures were not run.
    #[error("plan {plan}: procedure {procedure} failed")]
    Procedure {
        plan: String,
        procedure: String,
        #[source]
        source: anyhow::Error,
    },

    /// Shutdown was signalled before the next procedure started.
    #[error("plan {plan}: cancelled before procedure {procedure}")]
    Cancelled { plan: String, procedure: String },
}

impl ExecuteError {
    /// Returns true if execution stopped because of shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Name of the failing procedure, if a procedure failed.
    pub fn procedure(&self) -> Option<&str> {
        match self {
            Self::Procedure { procedure, .. } => Some(procedure),
            _ => None,
        }
    }
}

/// Runs plans to completion.
#[derive(Debug, Clone)]
pub struct Executor {
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    /// Create an executor that stops between procedures once `shutdown` is set.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// Build and run `plan`.
    pub async fn execute(&self, plan: &dyn Plan) -> Result<(), ExecuteError> {
        let plan_name = plan.name().to_string();

        let mut procedures = plan.create().await.map_err(|source| ExecuteError::Build {
            plan: plan_name.clone(),
            source,
        })?;

        if procedures.is_empty() {
            debug!(plan = %plan_name, "Plan has no procedures, nothing to do");
            return Ok(());
        }

        info!(
            plan = %plan_name,
            procedures = %describe(&procedures),
            "Executing plan"
        );

        let mut index = 0;
        while index < procedures.len() {
            let procedure = &procedures[index];

            if *self.shutdown.borrow() {
                return Err(ExecuteError::Cancelled {
                    plan: plan_name,
                    procedure: procedure.name().to_string(),
                });
            }

            debug!(plan = %plan_name, procedure = procedure.name(), "Running procedure");

            let children = procedure
                .run()
                .await
                .map_err(|source| ExecuteError::Procedure {
                    plan: plan_name.clone(),
                    procedure: procedure.name().to_string(),
                    source,
                })?;

            if children.is_empty() {
                index += 1;
            } else {
                debug!(
                    plan = %plan_name,
                    procedure = procedure.name(),
                    children = %describe(&children),
                    "Procedure expanded into follow-up procedures"
                );
                procedures = children;
                index = 0;
            }
        }

        debug!(plan = %plan_name, "Plan executed successfully");
        Ok(())
    }
}

fn describe(procedures: &[Box<dyn Procedure>]) -> String {
    procedures
        .iter()
        .map(|p| p.name())
        .collect::<Vec<_>>()
        .join(",")
}
