//! Turning Ctrl-C into an ordinary failure of the run.
//!
//! The terminal sends SIGINT to the whole foreground process group, so a
//! tool running at that moment dies and its failure unwinds the run. Between
//! tools the flag set here is checked instead.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::error::InstallError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Replace the default SIGINT disposition, which would kill the installer
/// before it could release what it holds.
pub(crate) fn install_handler() {
    if let Err(err) = ctrlc::set_handler(|| {
        tracing::warn!("Interrupted; stopping and releasing the target");
        INTERRUPTED.store(true, Ordering::SeqCst);
    }) {
        tracing::error!("failed to set Ctrl-C handler: {}", err);
    }
}

/// Fail if the run was interrupted.
pub(crate) fn check() -> Result<()> {
    check_flag(&INTERRUPTED)
}

pub(crate) fn check_flag(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(InstallError::Interrupted.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_flag() {
        let flag = AtomicBool::new(false);
        check_flag(&flag).unwrap();
        flag.store(true, Ordering::SeqCst);
        let err = check_flag(&flag).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::Interrupted)
        ));
    }
}
