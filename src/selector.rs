//! Provider selection: ranks candidate providers for a GPU
//! demand by price, adjusted by a per-`NodeClass` priority weight.

use crate::offering::{GpuModel, NormalizedPricing, Region};
use crate::pricing::PricingCache;
use crate::provider::Provider;

/// A provider eligible for a given NodePool, paired with the priority its
/// owning NodeClass carries (`spec.priority`, lower sorts first all else
/// equal — expressed here as a weight multiplier).
pub struct Candidate<'a> {
    pub provider: &'a Provider,
    pub priority: u32,
}

/// A ranked candidate, its effective (weighted) price, and the raw quote
/// behind it.
pub struct Ranked<'a> {
    pub provider: &'a Provider,
    pub effective_price: f64,
    pub pricing: NormalizedPricing,
}

const PRIORITY_WEIGHT_FACTOR: f64 = 0.1;

/// `effective_price = price_per_hour * (1 + priority * 0.1)`. A
/// priority of 0 is unweighted; each increment makes a provider 10% less
/// attractive relative to raw price, letting an operator express a soft
/// preference without excluding a provider outright.
fn effective_price(price_per_hour: f64, priority: u32) -> f64 {
    price_per_hour * (1.0 + priority as f64 * PRIORITY_WEIGHT_FACTOR)
}

/// Ranks `candidates` by effective price ascending, pricing every candidate
/// concurrently through the shared cache. Candidates whose pricing can't be
/// fetched are dropped rather than ranked last — the cache already logs the
/// failure. Ties keep the candidates' input order (`sort_by` is stable), so
/// the first-listed NodeClass wins a tie.
pub async fn rank<'a>(
    cache: &PricingCache,
    candidates: &[Candidate<'a>],
    gpu_type: &GpuModel,
    region: &Region,
) -> Vec<Ranked<'a>> {
    let providers: Vec<&'a Provider> = candidates.iter().map(|c| c.provider).collect();
    let priced = cache.get_many(&providers, gpu_type, region).await;

    let mut ranked = Vec::with_capacity(candidates.len());
    for (candidate, (_, price)) in candidates.iter().zip(priced) {
        if let Some(pricing) = price {
            ranked.push(Ranked {
                provider: candidate.provider,
                effective_price: effective_price(pricing.price_per_hour, candidate.priority),
                pricing,
            });
        }
    }
    ranked.sort_by(|a, b| a.effective_price.total_cmp(&b.effective_price));
    ranked
}

/// Convenience wrapper over [`rank`] returning just the winner, if any.
pub async fn select_best<'a>(
    cache: &PricingCache,
    candidates: &[Candidate<'a>],
    gpu_type: &GpuModel,
    region: &Region,
) -> Option<Ranked<'a>> {
    rank(cache, candidates, gpu_type, region).await.into_iter().next()
}
