use crate::envelope::{OperationError, ResultEnvelope};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetOutcome {
    Succeeded,
    Failed(String),
    Skipped(String),
}

/// Per-target bookkeeping for operations that repeat over several versions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FanOutSummary {
    pub targets: Vec<(String, TargetOutcome)>,
}

impl FanOutSummary {
    pub fn record(&mut self, target: impl Into<String>, outcome: TargetOutcome) {
        self.targets.push((target.into(), outcome));
    }

    pub fn succeeded(&mut self, target: impl Into<String>) {
        self.record(target, TargetOutcome::Succeeded);
    }

    pub fn failed(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.record(target, TargetOutcome::Failed(reason.into()));
    }

    pub fn skipped(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.record(target, TargetOutcome::Skipped(reason.into()));
    }

    pub fn total_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn success_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|(_, outcome)| *outcome == TargetOutcome::Succeeded)
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.failed_targets().len()
    }

    pub fn skipped_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TargetOutcome::Skipped(_)))
            .count()
    }

    pub fn succeeded_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|(_, outcome)| *outcome == TargetOutcome::Succeeded)
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn failed_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TargetOutcome::Failed(_)))
            .map(|(target, _)| target.clone())
            .collect()
    }

    /// Wraps `data` according to the aggregate outcome: no targets or no
    /// failures is a success, failures without any success is an error,
    /// anything else is partial. Skipped targets count neither way.
    pub fn into_envelope<T>(&self, data: T, action: &str, code: &str) -> ResultEnvelope<T> {
        let total = self.total_targets();
        if total == 0 {
            return ResultEnvelope::success(data).with_message(format!("No targets to {action}"));
        }

        let succeeded = self.success_count();
        let failed = self.failure_count();
        let skipped = self.skipped_count();
        let mut message = format!("{action}: {succeeded} of {total} targets succeeded");
        if skipped > 0 {
            message.push_str(&format!(", {skipped} skipped"));
        }
        if failed == 0 {
            return ResultEnvelope::success(data).with_message(message);
        }

        let mut error = OperationError::process(format!("{action} failed for {failed} target(s)"))
            .with_code(code)
            .with_targets(self.failed_targets());
        for (target, outcome) in &self.targets {
            if let TargetOutcome::Failed(reason) = outcome {
                error.details.insert(target.clone(), reason.clone());
            }
        }

        if succeeded == 0 {
            ResultEnvelope::error(error)
                .with_diagnostic_data(data)
                .with_message(message)
        } else {
            ResultEnvelope::partial(data, error).with_message(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fan_out_is_an_informational_success() {
        let summary = FanOutSummary::default();
        let envelope = summary.into_envelope((), "sync", "SYNC_ERROR");
        assert!(envelope.is_success());
        assert_eq!(envelope.message(), Some("No targets to sync"));
    }

    #[test]
    fn skipped_targets_do_not_count_as_failures() {
        let mut summary = FanOutSummary::default();
        summary.succeeded("pre-edit/app");
        summary.skipped("post-edit/app", "already exists");
        let envelope = summary.into_envelope((), "clone", "ADD_PROJECT_ERROR");
        assert!(envelope.is_success());
        assert_eq!(
            envelope.message(),
            Some("clone: 1 of 2 targets succeeded, 1 skipped")
        );
    }

    #[test]
    fn all_failures_is_an_error_with_diagnostic_data() {
        let mut summary = FanOutSummary::default();
        summary.failed("a/app", "denied");
        summary.failed("b/app", "denied");
        let envelope = summary.into_envelope(summary.clone(), "update", "EDIT_ERROR");
        assert!(envelope.is_error());
        assert_eq!(envelope.data().map(FanOutSummary::failure_count), Some(2));
        let error = envelope.error_ref().expect("error should be present");
        assert_eq!(error.targets, vec!["a/app", "b/app"]);
        assert_eq!(error.code(), Some("EDIT_ERROR"));
    }

    #[test]
    fn mixed_outcomes_are_partial() {
        let mut summary = FanOutSummary::default();
        summary.succeeded("a/app");
        summary.failed("b/app", "io error");
        let envelope = summary.into_envelope(7, "sync", "SYNC_ERROR");
        assert!(envelope.is_partial());
        assert_eq!(envelope.data(), Some(&7));
        let error = envelope.error_ref().expect("error should be present");
        assert_eq!(error.details.get("b/app").map(String::as_str), Some("io error"));
    }
}
