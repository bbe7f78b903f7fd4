/// Ordered set of interchangeable providers, tried front to back.
#[derive(Debug, Clone)]
pub struct ProviderChain<T: NamedProvider> {
    providers: Vec<T>,
}

pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl<T: NamedProvider + ?Sized> NamedProvider for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Result of arranging providers by a configured order.
#[derive(Debug, Clone)]
pub struct ChainBuild<T: NamedProvider> {
    pub chain: ProviderChain<T>,
    pub unknown: Vec<String>,
}

impl<T: NamedProvider> ProviderChain<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    /// Keeps the providers named in `order`, in that order. Names with no
    /// matching provider are returned in `unknown`; providers not named are
    /// dropped; a name listed twice is used once.
    pub fn ordered(available: Vec<T>, order: &[String]) -> ChainBuild<T> {
        let mut pool: Vec<Option<T>> = available.into_iter().map(Some).collect();
        let mut providers = Vec::new();
        let mut unknown = Vec::new();
        for raw in order {
            let wanted = normalize_provider_name(raw);
            let slot = pool.iter_mut().find(|slot| {
                slot.as_ref()
                    .map(|provider| normalize_provider_name(provider.name()) == wanted)
                    .unwrap_or(false)
            });
            match slot.and_then(Option::take) {
                Some(provider) => providers.push(provider),
                None => {
                    if !providers
                        .iter()
                        .any(|provider: &T| normalize_provider_name(provider.name()) == wanted)
                    {
                        unknown.push(raw.clone());
                    }
                }
            }
        }
        ChainBuild {
            chain: Self { providers },
            unknown,
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        let wanted = normalize_provider_name(name);
        self.providers
            .iter()
            .find(|provider| normalize_provider_name(provider.name()) == wanted)
    }

    /// Names in chain order.
    pub fn names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect()
    }

    pub fn providers(&self) -> &[T] {
        self.providers.as_slice()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Lowercases and maps legacy aliases (`mock` is the offline analyzer).
pub fn normalize_provider_name(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "mock" | "fallback" => "offline".to_string(),
        "claude" => "anthropic".to_string(),
        _ => lowered,
    }
}
