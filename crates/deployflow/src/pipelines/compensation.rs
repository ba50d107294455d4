//! Undo stack for multi-step provisioning.
//!
//! Each step that allocates something external registers how to release it.
//! On a hard failure the stack is unwound in reverse registration order (last
//! allocation released first). Undo failures are logged and skipped so one
//! stuck resource does not keep the others alive.

use crate::clients::ClientError;
use std::future::Future;
use std::pin::Pin;
use tracing::{info, warn};

type UndoFuture = Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>;
type Undo = Box<dyn FnOnce() -> UndoFuture + Send>;

#[derive(Default)]
pub struct Compensation {
    steps: Vec<(&'static str, Undo)>,
}

/// Outcome of [`Compensation::unwind`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnwindReport {
    /// Labels in the order they ran.
    pub ran: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl Compensation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        self.steps
            .push((label, Box::new(move || Box::pin(undo()) as UndoFuture)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn unwind(mut self) -> UnwindReport {
        let mut report = UnwindReport::default();
        while let Some((label, undo)) = self.steps.pop() {
            report.ran.push(label);
            match undo().await {
                Ok(()) => info!(step = label, "compensated"),
                Err(e) => {
                    warn!(step = label, error = %e, "compensation step failed");
                    report.failed.push(label);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn unwinds_in_reverse_and_keeps_going_after_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut comp = Compensation::new();

        for label in ["delete_storage", "delete_policy", "delete_instance"] {
            let seen = seen.clone();
            comp.push(label, move || async move {
                seen.lock().unwrap().push(label);
                if label == "delete_policy" {
                    Err(ClientError::Transport("reset".into()))
                } else {
                    Ok(())
                }
            });
        }
        assert_eq!(comp.len(), 3);

        let report = comp.unwind().await;
        assert_eq!(
            report.ran,
            vec!["delete_instance", "delete_policy", "delete_storage"]
        );
        assert_eq!(report.failed, vec!["delete_policy"]);
        assert_eq!(*seen.lock().unwrap(), report.ran);
    }

    #[tokio::test]
    async fn empty_stack_is_a_no_op() {
        let report = Compensation::new().unwind().await;
        assert!(report.ran.is_empty());
    }
}
