//! Closed factory mapping a `NodeClass.spec.provider` name to a concrete
//! [`Provider`]. Deliberately not an open-ended registry: an
//! unrecognized name is a validation error on the NodeClass, surfaced as a
//! status condition, not a runtime dispatch failure discovered later.

use crate::error::OperatorError;
use crate::provider::fake::FakeProvider;
use crate::provider::hetzner::HetznerAdapter;
use crate::provider::runpod::RunPodAdapter;
use crate::provider::vastai::VastAiAdapter;
use crate::provider::{AdapterHandle, Provider};

/// The closed enumeration of backend names a `NodeClass` may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderName {
    VastAi,
    RunPod,
    Hetzner,
    Fake,
}

impl ProviderName {
    pub fn parse(raw: &str) -> Result<Self, OperatorError> {
        match raw {
            "vastai" => Ok(Self::VastAi),
            "runpod" => Ok(Self::RunPod),
            "hetzner" => Ok(Self::Hetzner),
            "fake" => Ok(Self::Fake),
            other => Err(OperatorError::Validation {
                field: "spec.provider".to_string(),
                reason: format!(
                    "unrecognized provider `{other}` (expected one of: vastai, runpod, hetzner)"
                ),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VastAi => "vastai",
            Self::RunPod => "runpod",
            Self::Hetzner => "hetzner",
            Self::Fake => "fake",
        }
    }
}

/// Builds the adapter for a provider name given its resolved credential
/// (the value read out of the `Secret` referenced by the owning `NodeClass`)
/// and the timeout/shutdown handle every wire adapter races its calls
/// against. `Fake` ignores both entirely — it exists for tests, not for a
/// NodeClass a cluster operator would actually create.
pub fn build_provider(name: ProviderName, credential: &str, handle: AdapterHandle) -> Provider {
    match name {
        ProviderName::VastAi => Provider::VastAi(VastAiAdapter::with_handle(credential.to_string(), handle)),
        ProviderName::RunPod => Provider::RunPod(RunPodAdapter::with_handle(credential.to_string(), handle)),
        ProviderName::Hetzner => Provider::Hetzner(HetznerAdapter::with_handle(credential.to_string(), handle)),
        ProviderName::Fake => Provider::Fake(FakeProvider::new("fake")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_provider_names() {
        assert_eq!(ProviderName::parse("vastai").unwrap(), ProviderName::VastAi);
        assert_eq!(ProviderName::parse("runpod").unwrap(), ProviderName::RunPod);
        assert_eq!(ProviderName::parse("hetzner").unwrap(), ProviderName::Hetzner);
    }

    #[test]
    fn unknown_provider_name_is_a_validation_error() {
        let result = ProviderName::parse("aws");
        assert!(matches!(
            result,
            Err(OperatorError::Validation { field, .. }) if field == "spec.provider"
        ));
    }

    #[test]
    fn as_str_roundtrips_through_parse() {
        for name in [ProviderName::VastAi, ProviderName::RunPod, ProviderName::Hetzner] {
            assert_eq!(ProviderName::parse(name.as_str()).unwrap(), name);
        }
    }

    #[test]
    fn build_provider_names_match_factory_input() {
        let p = build_provider(ProviderName::VastAi, "key", AdapterHandle::default());
        assert_eq!(p.name(), "vastai");
        let p = build_provider(ProviderName::Fake, "unused", AdapterHandle::default());
        assert_eq!(p.name(), "fake");
    }
}
