//! Startup precondition: the operator must be registered with the ledger.

use crate::error::AvsError;
use crate::ledger::Ledger;
use crate::types::Address;
use std::sync::Arc;

pub struct RegistrationGuard {
    ledger: Arc<dyn Ledger>,
}

impl RegistrationGuard {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Fail with [`AvsError::Registration`] unless `operator` is registered.
    ///
    /// Checked once, before any event subscription is opened.
    pub async fn assert_registered(&self, operator: Address) -> Result<(), AvsError> {
        if self.ledger.operator_registered(operator).await? {
            tracing::info!(?operator, "Operator is registered");
            Ok(())
        } else {
            tracing::error!(?operator, "Operator is not registered; refusing to start");
            Err(AvsError::Registration(operator))
        }
    }
}
