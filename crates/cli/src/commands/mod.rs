use elif_migrate::{MigrationReporter, TracingReporter};

pub mod migrate;
pub mod status;

/// Progress goes to `tracing`. Failures are dropped here because every failed
/// command returns its error to `main`, which logs it once.
pub struct CliReporter(TracingReporter);

impl CliReporter {
    pub fn new(silent: bool) -> Self {
        Self(TracingReporter::new(silent))
    }
}

impl MigrationReporter for CliReporter {
    fn applied(&self, name: &str, dry: bool) {
        self.0.applied(name, dry);
    }

    fn reverted(&self, name: &str, dry: bool) {
        self.0.reverted(name, dry);
    }

    fn notice(&self, message: &str) {
        self.0.notice(message);
    }

    fn failure(&self, _message: &str) {}
}
