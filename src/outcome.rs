/// Result of a stage that must never fail the webhook: the value to report
/// plus an optional warning describing what degraded.
#[derive(Debug, Clone, PartialEq)]
pub struct BestEffort<T> {
    pub value: T,
    pub warning: Option<String>,
}

impl<T> BestEffort<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    pub fn degraded(value: T, warning: impl Into<String>) -> Self {
        Self {
            value,
            warning: Some(warning.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }
}
