//! Progress reporting
//!
//! The engine never prints directly; it tells a [`MigrationReporter`] what
//! happened. The default reporter forwards to `tracing`.

use tracing::{error, info};

/// Receives progress and failure notices from the engine
pub trait MigrationReporter: Send + Sync {
    /// A script was applied (or would have been, in a dry run)
    fn applied(&self, name: &str, dry: bool);

    /// A script was rolled back (or would have been, in a dry run)
    fn reverted(&self, name: &str, dry: bool);

    /// Informational notice
    fn notice(&self, message: &str);

    /// An operation failed
    fn failure(&self, message: &str);
}

fn dry_suffix(dry: bool) -> &'static str {
    if dry {
        " (dry run)"
    } else {
        ""
    }
}

/// Reporter backed by `tracing`
///
/// Silent mode drops progress and notices. Failures are always reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter {
    silent: bool,
}

impl TracingReporter {
    pub fn new(silent: bool) -> Self {
        Self { silent }
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

impl MigrationReporter for TracingReporter {
    fn applied(&self, name: &str, dry: bool) {
        if !self.silent {
            info!("+ Migration \"{}\" applied.{}", name, dry_suffix(dry));
        }
    }

    fn reverted(&self, name: &str, dry: bool) {
        if !self.silent {
            info!("- Migration \"{}\" rolled back.{}", name, dry_suffix(dry));
        }
    }

    fn notice(&self, message: &str) {
        if !self.silent {
            info!("{}", message);
        }
    }

    fn failure(&self, message: &str) {
        error!("{}", message);
    }
}
