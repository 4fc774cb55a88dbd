use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::Span;
use uuid::Uuid;

use crate::policy::RecoveryPolicy;

/// Handle shared by every component of one recovery session: the tracing
/// span all events attach to, the cancellation flag, and the active policy.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    session_id: String,
    span: Span,
    cancel_flag: Arc<AtomicBool>,
    policy: RecoveryPolicy,
}

impl RecoveryContext {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self::with_cancel_flag(policy, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel_flag(policy: RecoveryPolicy, cancel_flag: Arc<AtomicBool>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("recovery_session", session_id = %session_id);
        Self {
            session_id,
            span,
            cancel_flag,
            policy,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self::new(RecoveryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::RecoveryContext;
    use crate::policy::RecoveryPolicy;

    #[test]
    fn external_flag_cancels_context() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = RecoveryContext::with_cancel_flag(RecoveryPolicy::default(), Arc::clone(&flag));
        assert!(!ctx.is_cancelled());
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let a = RecoveryContext::default();
        let b = RecoveryContext::default();
        assert_ne!(a.session_id(), b.session_id());
    }
}
