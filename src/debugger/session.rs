use std::collections::BTreeMap;

use crate::error::ProtocolError;

struct Pending<T> {
    deadline_ms: u64,
    context: T,
}

/// Requests forwarded to a remote peer, keyed by sequence number.
///
/// `T` carries whatever the caller needs to answer once the reply (or a
/// synthetic timeout) arrives.
pub struct PendingRequests<T> {
    entries: BTreeMap<u64, Pending<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, seq: u64, now_ms: u64, timeout_ms: u64, context: T) {
        self.entries.insert(
            seq,
            Pending {
                deadline_ms: now_ms.saturating_add(timeout_ms),
                context,
            },
        );
    }

    /// Claim the entry for a reply. `None` when it already timed out or was never sent.
    pub fn resolve(&mut self, seq: u64) -> Option<T> {
        self.entries.remove(&seq).map(|p| p.context)
    }

    /// Remove every entry whose deadline passed, paired with its timeout error.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(T, ProtocolError)> {
        let due: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline_ms <= now_ms)
            .map(|(seq, _)| *seq)
            .collect();
        due.into_iter()
            .filter_map(|seq| {
                let pending = self.entries.remove(&seq)?;
                tracing::warn!(seq, "pending request timed out");
                Some((pending.context, ProtocolError::Timeout(seq)))
            })
            .collect()
    }

    pub fn cancel_all(&mut self) -> Vec<(T, ProtocolError)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(seq, p)| (p.context, ProtocolError::Cancelled(seq)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.values().map(|p| p.deadline_ms).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_before_deadline_resolves() {
        let mut pending = PendingRequests::new();
        pending.insert(7, 0, 100, "vars");
        assert!(pending.expire(50).is_empty());
        assert_eq!(pending.resolve(7), Some("vars"));
        assert!(pending.resolve(7).is_none());
    }

    #[test]
    fn late_reply_is_ignored_after_timeout() {
        let mut pending = PendingRequests::new();
        pending.insert(3, 10, 100, 42u64);
        pending.insert(4, 50, 100, 43u64);
        assert_eq!(pending.next_deadline(), Some(110));

        let expired = pending.expire(120);
        assert_eq!(expired, vec![(42, ProtocolError::Timeout(3))]);
        assert!(pending.resolve(3).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn cancel_rejects_everything() {
        let mut pending = PendingRequests::new();
        pending.insert(1, 0, 10, ());
        pending.insert(2, 0, 10, ());
        let cancelled = pending.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(cancelled[1].1, ProtocolError::Cancelled(2));
        assert!(pending.is_empty());
    }
}
