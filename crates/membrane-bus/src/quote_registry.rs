//! # Quote Registry and Quota Gate
//!
//! Quotes are single-use admission tickets. Admission is a test-and-set on
//! the quote's shard lock: for any number of concurrent admissions of one
//! `quote_id`, exactly one succeeds.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use membrane_types::{Price, QuotaDenied, QuoteResponse};
use tracing::debug;

/// A registered quote.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub quote_id: String,
    pub price: Price,
    pub expires_at: DateTime<Utc>,
    pub tenant: String,
    pub consumed: bool,
}

impl Quote {
    /// Build an unconsumed quote from a `quote.response` payload.
    #[must_use]
    pub fn from_response(response: &QuoteResponse) -> Self {
        Self {
            quote_id: response.quote_id.clone(),
            price: response.price.clone(),
            expires_at: response.expires_at,
            tenant: response.org.clone(),
            consumed: false,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of a debit settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The quote was open and is now consumed.
    Consumed,
    /// The quote had already been consumed; nothing changed.
    AlreadySettled,
}

/// Sharded in-memory quote store.
#[derive(Debug, Default)]
pub struct QuoteRegistry {
    quotes: DashMap<String, Quote>,
}

impl QuoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a quote. An existing quote with the same id is left untouched,
    /// so a replayed `quote.response` cannot reopen a consumed quote.
    ///
    /// Returns `true` if the quote was newly registered.
    pub fn insert(&self, quote: Quote) -> bool {
        match self.quotes.entry(quote.quote_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(quote_id = %quote.quote_id, tenant = %quote.tenant, "Quote registered");
                slot.insert(quote);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, quote_id: &str) -> Option<Quote> {
        self.quotes.get(quote_id).map(|q| q.clone())
    }

    /// Admit a quota-gated envelope now.
    ///
    /// # Errors
    ///
    /// See [`QuoteRegistry::admit_at`].
    pub fn admit(&self, quote_id: &str, tenant: &str) -> Result<(), QuotaDenied> {
        self.admit_at(quote_id, tenant, Utc::now())
    }

    /// Test-and-set admission at `now`.
    ///
    /// # Errors
    ///
    /// `UnknownQuote`, `TenantMismatch`, `AlreadyConsumed` or `Expired`. An
    /// expired quote is treated exactly like an absent one by callers.
    pub fn admit_at(
        &self,
        quote_id: &str,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaDenied> {
        // The guard holds the shard write lock for the whole check-and-mark.
        let mut quote = self
            .quotes
            .get_mut(quote_id)
            .ok_or_else(|| QuotaDenied::UnknownQuote(quote_id.to_string()))?;

        if quote.tenant != tenant {
            return Err(QuotaDenied::TenantMismatch {
                quote_id: quote_id.to_string(),
                tenant: tenant.to_string(),
            });
        }
        if quote.consumed {
            return Err(QuotaDenied::AlreadyConsumed(quote_id.to_string()));
        }
        if quote.is_expired_at(now) {
            return Err(QuotaDenied::Expired(quote_id.to_string()));
        }

        quote.consumed = true;
        Ok(())
    }

    /// Settle a debit against its quote. Idempotent.
    ///
    /// # Errors
    ///
    /// `UnknownQuote` or `TenantMismatch`.
    pub fn consume(&self, quote_id: &str, tenant: &str) -> Result<Settlement, QuotaDenied> {
        let mut quote = self
            .quotes
            .get_mut(quote_id)
            .ok_or_else(|| QuotaDenied::UnknownQuote(quote_id.to_string()))?;

        if quote.tenant != tenant {
            return Err(QuotaDenied::TenantMismatch {
                quote_id: quote_id.to_string(),
                tenant: tenant.to_string(),
            });
        }
        if quote.consumed {
            return Ok(Settlement::AlreadySettled);
        }
        quote.consumed = true;
        Ok(Settlement::Consumed)
    }

    /// Drop every quote that expired before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.quotes.len();
        self.quotes.retain(|_, quote| !quote.is_expired_at(now));
        let removed = before.saturating_sub(self.quotes.len());
        if removed > 0 {
            debug!(removed, "Purged expired quotes");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quote(id: &str, tenant: &str, ttl_secs: i64) -> Quote {
        Quote {
            quote_id: id.to_string(),
            price: Price::mind(0.05),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            tenant: tenant.to_string(),
            consumed: false,
        }
    }

    #[test]
    fn test_admit_once() {
        let registry = QuoteRegistry::new();
        assert!(registry.insert(quote("q-1", "acme", 300)));

        assert!(registry.admit("q-1", "acme").is_ok());
        assert_eq!(
            registry.admit("q-1", "acme"),
            Err(QuotaDenied::AlreadyConsumed("q-1".into()))
        );
        assert!(registry.get("q-1").unwrap().consumed);
    }

    #[test]
    fn test_unknown_and_expired() {
        let registry = QuoteRegistry::new();
        registry.insert(quote("q-old", "acme", -1));

        assert_eq!(
            registry.admit("q-none", "acme"),
            Err(QuotaDenied::UnknownQuote("q-none".into()))
        );
        assert_eq!(
            registry.admit("q-old", "acme"),
            Err(QuotaDenied::Expired("q-old".into()))
        );
    }

    #[test]
    fn test_tenant_isolation() {
        let registry = QuoteRegistry::new();
        registry.insert(quote("q-1", "acme", 300));

        assert!(matches!(
            registry.admit("q-1", "globex"),
            Err(QuotaDenied::TenantMismatch { .. })
        ));
        // The failed attempt did not burn the quote.
        assert!(registry.admit("q-1", "acme").is_ok());
    }

    #[test]
    fn test_insert_does_not_reopen() {
        let registry = QuoteRegistry::new();
        registry.insert(quote("q-1", "acme", 300));
        registry.admit("q-1", "acme").unwrap();

        assert!(!registry.insert(quote("q-1", "acme", 300)));
        assert!(registry.get("q-1").unwrap().consumed);
    }

    #[test]
    fn test_consume_is_idempotent() {
        let registry = QuoteRegistry::new();
        registry.insert(quote("q-1", "acme", 300));

        assert_eq!(registry.consume("q-1", "acme"), Ok(Settlement::Consumed));
        assert_eq!(
            registry.consume("q-1", "acme"),
            Ok(Settlement::AlreadySettled)
        );
        assert!(registry.admit("q-1", "acme").is_err());
    }

    #[test]
    fn test_purge_expired() {
        let registry = QuoteRegistry::new();
        registry.insert(quote("q-old", "acme", -10));
        registry.insert(quote("q-new", "acme", 300));

        assert_eq!(registry.purge_expired(Utc::now()), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("q-new").is_some());
    }

    #[test]
    fn test_concurrent_admission_single_winner() {
        let registry = Arc::new(QuoteRegistry::new());
        registry.insert(quote("q-race", "acme", 300));
        let winners = Arc::new(AtomicUsize::new(0));
        let losers = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let winners = Arc::clone(&winners);
                let losers = Arc::clone(&losers);
                std::thread::spawn(move || match registry.admit("q-race", "acme") {
                    Ok(()) => winners.fetch_add(1, Ordering::SeqCst),
                    Err(QuotaDenied::AlreadyConsumed(_)) => losers.fetch_add(1, Ordering::SeqCst),
                    Err(other) => panic!("unexpected denial {other:?}"),
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(losers.load(Ordering::SeqCst), 31);
    }
}
