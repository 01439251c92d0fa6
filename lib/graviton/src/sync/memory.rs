use crate::support::{raise, ErrorKind, NetResult};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks bytes charged against a configurable cap. Shared between the
/// entities that allocate (framers, send trackers, recycle pools) via `Arc`.
///
/// `increase` refuses the charge when it would push usage past the limit;
/// the caller is expected to tear down the offending entity. The default
/// limit is unbounded.
#[derive(Debug)]
pub struct MemoryAccountant {
    current: AtomicUsize,
    limit: usize,
}

impl MemoryAccountant {
    /// An accountant that never refuses a charge.
    #[inline]
    pub fn unbounded() -> MemoryAccountant {
        MemoryAccountant::with_limit(usize::max_value())
    }

    #[inline]
    pub fn with_limit(limit: usize) -> MemoryAccountant {
        MemoryAccountant {
            current: AtomicUsize::new(0),
            limit,
        }
    }

    /// Builds from an optional cap, `None` meaning unbounded.
    #[inline]
    pub fn from_option(limit: Option<usize>) -> MemoryAccountant {
        match limit {
            Some(limit) => MemoryAccountant::with_limit(limit),
            None => MemoryAccountant::unbounded(),
        }
    }

    #[inline]
    pub fn usage(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Charges `bytes` against the cap.
    pub fn increase(&self, bytes: usize) -> NetResult<()> {
        let limit = self.limit;
        let result = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match current.checked_add(bytes) {
                    Some(next) if next <= limit => Some(next),
                    _ => None,
                }
            });

        match result {
            Ok(_) => Ok(()),
            Err(_) => raise(
                ErrorKind::MemoryLimitExceeded,
                "charging a bounded memory accountant",
            ),
        }
    }

    /// Releases a previous charge. Saturates at zero so a release can never
    /// underflow the account.
    pub fn decrease(&self, bytes: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_accepts_large_charges() {
        let accountant = MemoryAccountant::unbounded();
        accountant.increase(1 << 40).unwrap();
        assert_eq!(accountant.usage(), 1 << 40);
    }

    #[test]
    fn test_limit_is_enforced() {
        let accountant = MemoryAccountant::with_limit(100);
        accountant.increase(60).unwrap();
        accountant.increase(40).unwrap();

        let err = accountant.increase(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryLimitExceeded);

        // The failed charge must not be recorded.
        assert_eq!(accountant.usage(), 100);
    }

    #[test]
    fn test_decrease_releases_charge() {
        let accountant = MemoryAccountant::with_limit(100);
        accountant.increase(100).unwrap();
        accountant.decrease(30);
        accountant.increase(30).unwrap();
        assert_eq!(accountant.usage(), 100);
    }

    #[test]
    fn test_decrease_saturates() {
        let accountant = MemoryAccountant::with_limit(10);
        accountant.decrease(50);
        assert_eq!(accountant.usage(), 0);
    }

    #[test]
    fn test_overflowing_charge_is_refused() {
        let accountant = MemoryAccountant::unbounded();
        accountant.increase(10).unwrap();
        assert!(accountant.increase(usize::max_value()).is_err());
    }
}
