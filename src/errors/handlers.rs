use super::{ManagerError, ManagerResult, ResourceFailure};
use tracing::{info, warn};

/// Collects failures from a best-effort loop (rollback, stop, destroy) so
/// one bad resource never stops the rest from being handled.
pub struct FailureLog {
    operation: String,
    failures: Vec<ResourceFailure>,
}

impl FailureLog {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failures: Vec::new(),
        }
    }

    /// Keep the value on success; log and remember the error otherwise.
    pub fn record<T>(&mut self, resource: impl Into<String>, result: ManagerResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(resource, error);
                None
            }
        }
    }

    pub fn push(&mut self, resource: impl Into<String>, error: ManagerError) {
        let resource = resource.into();
        warn!(
            operation = %self.operation,
            resource = %resource,
            error = %error,
            "Step failed, continuing with remaining resources"
        );
        self.failures.push(ResourceFailure { resource, error });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failed(&self, resource: &str) -> bool {
        self.failures.iter().any(|f| f.resource == resource)
    }

    pub fn into_failures(self) -> Vec<ResourceFailure> {
        self.failures
    }

    /// `Ok(())` when nothing failed, otherwise one `Aggregate` error.
    pub fn into_result(self) -> ManagerResult<()> {
        if self.failures.is_empty() {
            info!(operation = %self.operation, "Completed without failures");
            return Ok(());
        }
        Err(ManagerError::Aggregate {
            operation: self.operation,
            failures: self.failures,
        })
    }
}
