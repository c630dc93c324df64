//! 逐笔进度回调与终态记账。每个下标只记一次终态。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use solana_sdk::signature::Signature;

/// (批内下标, 是否落地, 签名字符串)。失败时签名可能为空串。
pub type ProgressCallback = Arc<dyn Fn(usize, bool, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Pending,
    Landed,
    FailedValidation,
    FailedNetwork,
    Expired,
}

impl OutcomeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutcomeStatus::Pending)
    }
}

/// 单笔交易的终态记录。bundle 投递时所有交易共享同一 bundle_id。
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub signature: Option<Signature>,
    pub status: OutcomeStatus,
    pub bundle_id: Option<String>,
}

impl TransactionOutcome {
    fn pending() -> Self {
        Self {
            signature: None,
            status: OutcomeStatus::Pending,
            bundle_id: None,
        }
    }
}

pub struct Reporter {
    callback: Option<ProgressCallback>,
    outcomes: Mutex<Vec<TransactionOutcome>>,
    landed: AtomicUsize,
}

impl Reporter {
    pub fn new(batch_size: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            outcomes: Mutex::new(vec![TransactionOutcome::pending(); batch_size]),
            landed: AtomicUsize::new(0),
        }
    }

    /// 幂等记账：同一下标的后续调用被丢弃。
    pub fn record(&self, index: usize, status: OutcomeStatus, signature: Option<Signature>) {
        self.record_inner(index, status, signature, None);
    }

    fn record_inner(
        &self,
        index: usize,
        status: OutcomeStatus,
        signature: Option<Signature>,
        bundle_id: Option<String>,
    ) {
        if !status.is_terminal() {
            return;
        }
        {
            let mut outcomes = self.outcomes.lock();
            match outcomes.get_mut(index) {
                Some(slot) if !slot.status.is_terminal() => {
                    slot.status = status;
                    slot.signature = signature;
                    slot.bundle_id = bundle_id;
                }
                _ => return,
            }
        }
        let success = status == OutcomeStatus::Landed;
        if success {
            self.landed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(callback) = &self.callback {
            let rendered = signature.map(|sig| sig.to_string()).unwrap_or_default();
            callback(index, success, &rendered);
        }
    }

    /// bundle 整批落地：所有未终态的下标记为成功并带上 bundle_id。
    pub fn record_bundle(&self, bundle_id: &str, signatures: &[Signature]) {
        for (index, signature) in signatures.iter().enumerate() {
            self.record_inner(
                index,
                OutcomeStatus::Landed,
                Some(*signature),
                Some(bundle_id.to_string()),
            );
        }
    }

    pub fn landed_count(&self) -> usize {
        self.landed.load(Ordering::Relaxed)
    }

    pub fn outcomes(&self) -> Vec<TransactionOutcome> {
        self.outcomes.lock().clone()
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("has_callback", &self.callback.is_some())
            .field("outcomes", &*self.outcomes.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_exactly_once_per_index() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let reporter = Reporter::new(
            2,
            Some(Arc::new(move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        reporter.record(0, OutcomeStatus::Landed, Some(Signature::default()));
        reporter.record(0, OutcomeStatus::FailedNetwork, None);
        reporter.record(1, OutcomeStatus::Expired, None);
        reporter.record(5, OutcomeStatus::Landed, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.landed_count(), 1);

        let outcomes = reporter.outcomes();
        assert_eq!(outcomes[0].status, OutcomeStatus::Landed);
        assert_eq!(outcomes[1].status, OutcomeStatus::Expired);
    }

    #[test]
    fn bundle_record_respects_prior_reports() {
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();
        let reporter = Reporter::new(
            3,
            Some(Arc::new(move |_, success, _| {
                if !success {
                    failures_clone.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        reporter.record(1, OutcomeStatus::FailedValidation, None);
        reporter.record_bundle("0x0", &[Signature::default(); 3]);
        // 下标 1 已以失败记账，bundle 不得覆盖。
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.landed_count(), 2);

        let outcomes = reporter.outcomes();
        assert_eq!(outcomes[0].bundle_id.as_deref(), Some("0x0"));
        assert!(outcomes[1].bundle_id.is_none());
    }

    #[test]
    fn pending_is_not_recorded() {
        let reporter = Reporter::new(1, None);
        reporter.record(0, OutcomeStatus::Pending, None);
        assert_eq!(reporter.outcomes()[0].status, OutcomeStatus::Pending);
        reporter.record(0, OutcomeStatus::Landed, Some(Signature::default()));
        assert_eq!(reporter.landed_count(), 1);
    }
}
