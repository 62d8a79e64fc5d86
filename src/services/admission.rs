use crate::error::{AppError, Result};

/// Per-user cap on concurrently active VPN sessions.
#[derive(Clone, Copy, Debug)]
pub struct AdmissionController {
    max_connections: usize,
}

impl AdmissionController {
    pub fn new(max_connections: usize) -> Self {
        Self { max_connections }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// `active` counts stored active sessions plus in-flight connects.
    pub fn check(&self, active: usize) -> Result<()> {
        if active >= self.max_connections {
            return Err(AppError::ConnectionLimitExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_inclusive() {
        let single = AdmissionController::new(1);
        assert!(single.check(0).is_ok());
        assert!(matches!(single.check(1), Err(AppError::ConnectionLimitExceeded)));

        let triple = AdmissionController::new(3);
        assert!(triple.check(2).is_ok());
        assert!(triple.check(3).is_err());
    }
}
