//! TTL-guarded pricing cache.
//!
//! Keyed on `(gpu_type, region)`, each entry holding every provider's last
//! known price for that pair. A miss or an expired entry triggers a
//! concurrent refetch across every provider passed in for that lookup —
//! fetch failures are advisory, per-provider: dropped and logged, never
//! surfaced to the caller, since a pricing hiccup on one provider shouldn't
//! block selection across the rest.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::warn;

use crate::offering::{GpuModel, NormalizedPricing, Region};
use crate::provider::Provider;

#[derive(Debug, Clone)]
struct CacheEntry {
    prices: HashMap<String, NormalizedPricing>,
    cached_at: std::time::Instant,
}

type CacheKey = (String, String);

/// Caches normalized pricing per `(gpu_type, region)` for `ttl`. `ttl ==
/// Duration::ZERO` disables caching outright — every call is a live fetch.
///
/// Backed by a `tokio::sync::RwLock` rather than `std::sync::Mutex` because
/// the write path holds the lock across every provider's own `.await` for
/// the whole miss-then-fetch-then-populate sequence: read lock check, then
/// upgrade to a write lock and recheck (double-checked population). This is
/// what makes concurrent lookups for the same key collapse into a single
/// round of underlying adapter calls instead of each racing its own
/// fetch — the second caller blocks on the write lock and, once it
/// acquires it, finds the entry the first caller just populated. If the
/// task holding the lock is cancelled mid-fetch the guard drops without
/// having written anything, so the cache is left exactly as it was.
pub struct PricingCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl PricingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(gpu_type: &GpuModel, region: &Region) -> CacheKey {
        (gpu_type.to_string(), region.0.clone())
    }

    fn fresh<'a>(&self, entries: &'a HashMap<CacheKey, CacheEntry>, key: &CacheKey) -> Option<&'a CacheEntry> {
        entries
            .get(key)
            .filter(|e| self.ttl > Duration::ZERO && e.cached_at.elapsed() < self.ttl)
    }

    /// Resolves pricing for every entry in `providers` against
    /// `(gpu_type, region)` in one shared cache entry, fetching concurrently
    /// across providers on a miss or expiry. Returns one result per input
    /// provider, in the same order; `None` where that provider's price
    /// couldn't be resolved this round.
    pub async fn get_many<'a>(
        &self,
        providers: &[&'a Provider],
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Vec<(&'a Provider, Option<NormalizedPricing>)> {
        let key = Self::key(gpu_type, region);

        {
            let entries = self.entries.read().await;
            if let Some(entry) = self.fresh(&entries, &key) {
                return providers
                    .iter()
                    .map(|p| (*p, entry.prices.get(p.name()).cloned()))
                    .collect();
            }
        }

        // Upgrade to the write lock and recheck: a concurrent caller may have
        // already populated this key while we were waiting for the lock.
        let mut entries = self.entries.write().await;
        if let Some(entry) = self.fresh(&entries, &key) {
            return providers
                .iter()
                .map(|p| (*p, entry.prices.get(p.name()).cloned()))
                .collect();
        }

        let fetches = providers.iter().map(|provider| async move {
            let result = provider.get_normalized_pricing(gpu_type, region).await;
            (*provider, result)
        });
        let results = join_all(fetches).await;

        let mut cached_prices = HashMap::with_capacity(results.len());
        let mut out = Vec::with_capacity(results.len());
        for (provider, result) in results {
            match result {
                Ok(pricing) => {
                    cached_prices.insert(provider.name().to_string(), pricing.clone());
                    out.push((provider, Some(pricing)));
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "pricing fetch failed, skipping provider for this selection");
                    out.push((provider, None));
                }
            }
        }

        if self.ttl > Duration::ZERO {
            entries.insert(
                key,
                CacheEntry {
                    prices: cached_prices,
                    cached_at: std::time::Instant::now(),
                },
            );
        }

        out
    }

    /// Single-provider convenience over [`get_many`].
    pub async fn get_pricing(
        &self,
        provider: &Provider,
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Option<NormalizedPricing> {
        self.get_many(&[provider], gpu_type, region)
            .await
            .into_iter()
            .next()
            .and_then(|(_, price)| price)
    }

    /// Fetches pricing from every candidate provider concurrently and
    /// returns the cheapest. Providers that fail to price are dropped, not
    /// treated as a fatal error for the whole lookup.
    pub async fn get_best_price<'a>(
        &self,
        providers: &'a [Provider],
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Option<(&'a Provider, NormalizedPricing)> {
        let refs: Vec<&'a Provider> = providers.iter().collect();
        let mut best: Option<(&'a Provider, NormalizedPricing)> = None;
        for (provider, price) in self.get_many(&refs, gpu_type, region).await {
            let Some(pricing) = price else { continue };
            let replace = match &best {
                None => true,
                Some((_, current)) => pricing.price_per_hour < current.price_per_hour,
            };
            if replace {
                best = Some((provider, pricing));
            }
        }
        best
    }

    /// All candidate providers' pricing, cheapest first, fetched
    /// concurrently. Same drop-on-error semantics as `get_best_price`.
    pub async fn get_sorted_pricing<'a>(
        &self,
        providers: &'a [Provider],
        gpu_type: &GpuModel,
        region: &Region,
    ) -> Vec<(&'a Provider, NormalizedPricing)> {
        let refs: Vec<&'a Provider> = providers.iter().collect();
        let mut results: Vec<(&'a Provider, NormalizedPricing)> = self
            .get_many(&refs, gpu_type, region)
            .await
            .into_iter()
            .filter_map(|(provider, price)| price.map(|p| (provider, p)))
            .collect();
        results.sort_by(|a, b| a.1.price_per_hour.total_cmp(&b.1.price_per_hour));
        results
    }

    pub async fn clear_cache(&self) {
        self.entries.write().await.clear();
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    async fn force_stale(&self, gpu_type: &GpuModel, region: &Region) {
        let key = Self::key(gpu_type, region);
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.cached_at -= self.ttl + Duration::from_secs(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;

    fn gpu() -> GpuModel {
        GpuModel::NvidiaA100
    }

    fn region() -> Region {
        Region("us-east-1".into())
    }

    #[tokio::test]
    async fn caches_pricing_within_ttl() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let provider = Provider::Fake(FakeProvider::new("fake").with_price(&gpu(), &region(), 2.0));

        let first = cache.get_pricing(&provider, &gpu(), &region()).await.unwrap();
        assert_eq!(first.price_per_hour, 2.0);
        assert_eq!(cache.entry_count().await, 1);

        // The underlying fake has no second price configured; a cache hit
        // must not attempt a second fetch.
        let second = cache.get_pricing(&provider, &gpu(), &region()).await.unwrap();
        assert_eq!(second.price_per_hour, 2.0);
    }

    #[tokio::test]
    async fn zero_ttl_never_caches() {
        let cache = PricingCache::new(Duration::ZERO);
        let provider = Provider::Fake(FakeProvider::new("fake").with_price(&gpu(), &region(), 2.0));
        cache.get_pricing(&provider, &gpu(), &region()).await;
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let provider = Provider::Fake(FakeProvider::new("fake").with_price(&gpu(), &region(), 2.0));
        cache.get_pricing(&provider, &gpu(), &region()).await;
        cache.force_stale(&gpu(), &region()).await;
        // Fetch still succeeds (same configured price); this exercises the
        // refetch path rather than the early-return hit path.
        let refreshed = cache.get_pricing(&provider, &gpu(), &region()).await.unwrap();
        assert_eq!(refreshed.price_per_hour, 2.0);
    }

    #[tokio::test]
    async fn concurrent_fetches_for_the_same_key_call_the_adapter_once() {
        // A cache hit after concurrent fetches must call the underlying
        // adapter exactly once. The fake sleeps inside get_normalized_pricing
        // so both concurrent callers are guaranteed to race the write lock.
        let cache = std::sync::Arc::new(PricingCache::new(Duration::from_secs(60)));
        let provider = std::sync::Arc::new(Provider::Fake(
            FakeProvider::new("fake")
                .with_price(&gpu(), &region(), 2.0)
                .with_pricing_delay(Duration::from_millis(50)),
        ));

        let (a, b) = {
            let cache_a = cache.clone();
            let provider_a = provider.clone();
            let cache_b = cache.clone();
            let provider_b = provider.clone();
            tokio::join!(
                tokio::spawn(async move { cache_a.get_pricing(provider_a.as_ref(), &gpu(), &region()).await }),
                tokio::spawn(async move { cache_b.get_pricing(provider_b.as_ref(), &gpu(), &region()).await }),
            )
        };

        assert_eq!(a.unwrap().unwrap().price_per_hour, 2.0);
        assert_eq!(b.unwrap().unwrap().price_per_hour, 2.0);

        let Provider::Fake(fake) = provider.as_ref() else {
            unreachable!()
        };
        assert_eq!(fake.pricing_calls(), 1);
    }

    #[tokio::test]
    async fn get_best_price_picks_cheapest_and_drops_failures() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let cheap = Provider::Fake(FakeProvider::new("cheap").with_price(&gpu(), &region(), 1.5));
        let pricey = Provider::Fake(FakeProvider::new("pricey").with_price(&gpu(), &region(), 4.0));
        let unpriced = Provider::Fake(FakeProvider::new("unpriced"));
        let providers = vec![pricey, cheap, unpriced];

        let (best, pricing) = cache.get_best_price(&providers, &gpu(), &region()).await.unwrap();
        assert_eq!(best.name(), "cheap");
        assert_eq!(pricing.price_per_hour, 1.5);
    }

    #[tokio::test]
    async fn get_sorted_pricing_orders_cheapest_first() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let a = Provider::Fake(FakeProvider::new("a").with_price(&gpu(), &region(), 3.0));
        let b = Provider::Fake(FakeProvider::new("b").with_price(&gpu(), &region(), 1.0));
        let providers = vec![a, b];

        let sorted = cache.get_sorted_pricing(&providers, &gpu(), &region()).await;
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].0.name(), "b");
        assert_eq!(sorted[1].0.name(), "a");
    }

    #[tokio::test]
    async fn concurrent_fetch_queries_every_provider_in_one_round() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let a = Provider::Fake(
            FakeProvider::new("a")
                .with_price(&gpu(), &region(), 3.0)
                .with_pricing_delay(Duration::from_millis(20)),
        );
        let b = Provider::Fake(
            FakeProvider::new("b")
                .with_price(&gpu(), &region(), 1.0)
                .with_pricing_delay(Duration::from_millis(20)),
        );
        let providers = vec![a, b];

        let started = std::time::Instant::now();
        let sorted = cache.get_sorted_pricing(&providers, &gpu(), &region()).await;
        // Both providers sleep 20ms; a sequential fetch would take ~40ms.
        // Concurrent fetch keeps the whole round close to a single delay.
        assert!(started.elapsed() < Duration::from_millis(35));
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].0.name(), "b");
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let provider = Provider::Fake(FakeProvider::new("fake").with_price(&gpu(), &region(), 2.0));
        cache.get_pricing(&provider, &gpu(), &region()).await;
        assert_eq!(cache.entry_count().await, 1);
        cache.clear_cache().await;
        assert_eq!(cache.entry_count().await, 0);
    }
}
