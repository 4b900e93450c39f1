//! Single delivery attempts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use cake_directory::UserRecord;
use cake_mailer::EmailTransport;

/// Calls the email transport once per attempt. Never retries.
#[derive(Clone)]
pub struct DeliveryExecutor {
    transport: Arc<dyn EmailTransport>,
    timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn EmailTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Send the birthday email to `user`.
    ///
    /// True only when the transport confirms delivery within the timeout.
    pub async fn attempt(&self, user: &UserRecord) -> bool {
        let name = user.display_name();
        match tokio::time::timeout(self.timeout, self.transport.send(&name, &user.email)).await {
            Ok(true) => {
                debug!(user_id = %user.id, "transport accepted email");
                true
            }
            Ok(false) => {
                warn!(user_id = %user.id, "transport rejected email");
                false
            }
            Err(_) => {
                warn!(
                    user_id = %user.id,
                    timeout_secs = self.timeout.as_secs(),
                    "delivery attempt timed out"
                );
                false
            }
        }
    }
}
