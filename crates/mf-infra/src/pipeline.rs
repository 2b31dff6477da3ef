//! Shared shape of the provisioning and teardown pipelines.
//!
//! Provisioning is a strictly ordered chain of steps; the first failure
//! aborts the chain and is reported with the step name attached. Resources
//! created by earlier steps are left in place for a later delete to remove.
//!
//! Teardown runs in reverse dependency order and treats "already absent" as
//! success, so it can be re-run after any partial failure.

use std::future::Future;

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Run one provisioning step, annotating any failure with its name.
pub async fn step<T>(name: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    debug!(step = name, "running step");
    fut.await.map_err(|e| e.in_step(name))
}

/// Bookkeeping for one teardown run.
#[derive(Debug)]
pub struct Teardown {
    target: String,
    completed: Vec<&'static str>,
}

impl Teardown {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            completed: Vec::new(),
        }
    }

    /// Run one teardown step. A not-found failure counts as success and
    /// yields `None`; any other failure stops the teardown.
    pub async fn step<T>(
        &mut self,
        name: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<Option<T>> {
        match fut.await {
            Ok(value) => {
                debug!(server = %self.target, step = name, "teardown step done");
                self.completed.push(name);
                Ok(Some(value))
            }
            Err(e) if e.is_not_found() => {
                debug!(server = %self.target, step = name, "already absent");
                self.completed.push(name);
                Ok(None)
            }
            Err(e) => {
                warn!(server = %self.target, step = name, error = %e, "teardown step failed");
                Err(self.fail(name, e))
            }
        }
    }

    fn fail(&self, name: &'static str, err: Error) -> Error {
        if self.completed.is_empty() {
            err.in_step(name)
        } else {
            Error::PartialTeardown {
                step: name,
                completed: self.completed.clone(),
                source: Box::new(err),
            }
        }
    }

    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }

    pub fn finish(self) -> Result<()> {
        info!(server = %self.target, steps = self.completed.len(), "teardown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn step_failures_carry_the_step_name() {
        let err = step("create subnet", async {
            Err::<(), _>(Error::Provider("quota exceeded".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.step(), Some("create subnet"));
        assert_eq!(err.to_string(), "create subnet: provider api error: quota exceeded");
    }

    #[tokio::test]
    async fn absent_resources_count_as_removed() {
        let mut td = Teardown::new("lobby");
        let got = td
            .step("delete subnet", async {
                Err::<(), _>(Error::NotFound("subnet-1".into()))
            })
            .await
            .unwrap();

        assert_eq!(got, None);
        assert_eq!(td.completed(), ["delete subnet"]);
        assert!(td.finish().is_ok());
    }

    #[tokio::test]
    async fn failure_after_progress_is_partial() {
        let mut td = Teardown::new("lobby");
        td.step("terminate instance", async { Ok(()) }).await.unwrap();
        td.step("delete security group", async { Ok(()) })
            .await
            .unwrap();

        let err = td
            .step("delete vpc", async {
                Err::<(), _>(Error::Provider("DependencyViolation".into()))
            })
            .await
            .unwrap_err();

        match err {
            Error::PartialTeardown {
                step,
                completed,
                source,
            } => {
                assert_eq!(step, "delete vpc");
                assert_eq!(completed, ["terminate instance", "delete security group"]);
                assert!(matches!(*source, Error::Provider(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failure_on_first_step_is_not_partial() {
        let mut td = Teardown::new("lobby");
        let err = td
            .step("describe instance", async {
                Err::<(), _>(Error::Provider("unauthorized".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InStep { step: "describe instance", .. }));
    }
}
