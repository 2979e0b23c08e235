use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;

/// Initial retransmission timeout of a stun transaction.
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Retransmits before a transaction stops being re-sent.
pub const MAX_RETRANSMITS: u32 = 7;

/// Hard deadline for a transaction, measured from the first send.
pub const TRANSACTION_BUDGET: Duration = Duration::from_millis(39_500);

/// What a pending request was for.
///
/// Responses and timeouts are dispatched on this; the transaction id
/// itself carries no meaning beyond matching.
#[derive(Debug, Clone)]
pub enum Request {
    Allocate,
    Refresh {
        deallocate: bool,
    },
    CreatePermission {
        peers: Vec<SocketAddr>,
        retried: bool,
    },
    ChannelBind {
        peer: SocketAddr,
        number: u16,
        retried: bool,
    },
}

struct Transaction {
    request: Request,
    bytes: Bytes,
    started: Instant,
    next_retransmit: Instant,
    rto: Duration,
    retransmits: u32,
}

impl Transaction {
    // After the retransmit budget is spent the only event left is the
    // overall deadline.
    fn next_event(&self) -> Instant {
        let deadline = self.started + TRANSACTION_BUDGET;
        if self.retransmits >= MAX_RETRANSMITS {
            deadline
        } else {
            self.next_retransmit.min(deadline)
        }
    }
}

/// In-flight stun requests keyed by transaction id, with the
/// retransmission clock.
#[derive(Default)]
pub struct Transactions(HashMap<[u8; 12], Transaction>);

impl Transactions {
    pub fn insert(&mut self, id: [u8; 12], request: Request, bytes: Bytes, now: Instant) {
        self.0.insert(
            id,
            Transaction {
                request,
                bytes,
                started: now,
                next_retransmit: now + INITIAL_RTO,
                rto: INITIAL_RTO,
                retransmits: 0,
            },
        );
    }

    /// Match a response by transaction id, completing the transaction.
    pub fn remove(&mut self, id: &[u8]) -> Option<Request> {
        let id: [u8; 12] = id.try_into().ok()?;
        self.0.remove(&id).map(|it| it.request)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The next instant at which `handle_timeout` has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.0.values().map(|it| it.next_event()).min()
    }

    /// Drive the retransmission clock.
    ///
    /// Requests due for a retransmit are pushed to `retransmit` with their
    /// backoff doubled; requests past the overall budget are removed and
    /// their purpose pushed to `expired`.
    pub fn handle_timeout(
        &mut self,
        now: Instant,
        retransmit: &mut Vec<Bytes>,
        expired: &mut Vec<Request>,
    ) {
        let mut dead = Vec::new();

        for (id, transaction) in self.0.iter_mut() {
            if now >= transaction.started + TRANSACTION_BUDGET
                || (transaction.retransmits >= MAX_RETRANSMITS
                    && now >= transaction.next_retransmit)
            {
                dead.push(*id);
                continue;
            }

            if transaction.retransmits < MAX_RETRANSMITS && now >= transaction.next_retransmit {
                transaction.retransmits += 1;
                transaction.rto *= 2;
                transaction.next_retransmit = now + transaction.rto;
                retransmit.push(transaction.bytes.clone());
            }
        }

        for id in dead {
            if let Some(it) = self.0.remove(&id) {
                expired.push(it.request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_backoff() {
        let mut transactions = Transactions::default();
        let start = Instant::now();

        transactions.insert([1; 12], Request::Allocate, Bytes::from_static(b"x"), start);
        assert_eq!(transactions.poll_timeout(), Some(start + INITIAL_RTO));

        let mut retransmit = Vec::new();
        let mut expired = Vec::new();

        // first retransmit fires at 100ms, the next is armed at +200ms.
        transactions.handle_timeout(start + INITIAL_RTO, &mut retransmit, &mut expired);
        assert_eq!(retransmit.len(), 1);
        assert!(expired.is_empty());
        assert_eq!(
            transactions.poll_timeout(),
            Some(start + INITIAL_RTO + INITIAL_RTO * 2)
        );
    }

    #[test]
    fn test_transaction_expiry() {
        let mut transactions = Transactions::default();
        let start = Instant::now();

        transactions.insert([1; 12], Request::Allocate, Bytes::from_static(b"x"), start);

        let mut retransmit = Vec::new();
        let mut expired = Vec::new();

        transactions.handle_timeout(start + TRANSACTION_BUDGET, &mut retransmit, &mut expired);
        assert!(retransmit.is_empty());
        assert_eq!(expired.len(), 1);
        assert!(transactions.is_empty());
        assert_eq!(transactions.poll_timeout(), None);
    }

    #[test]
    fn test_response_completes_transaction() {
        let mut transactions = Transactions::default();
        let start = Instant::now();

        transactions.insert([7; 12], Request::Allocate, Bytes::from_static(b"x"), start);

        assert!(matches!(
            transactions.remove(&[7; 12][..]),
            Some(Request::Allocate)
        ));
        assert!(transactions.remove(&[7; 12][..]).is_none());
    }
}
