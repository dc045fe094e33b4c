use std::fmt::{self, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The preset a [`CachingStrategy`] was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Never read from or write to the cache.
    NoStore,
    /// See [`CachingStrategy::short`].
    Short,
    /// See [`CachingStrategy::long`].
    Long,
    /// Explicit max-age and stale-while-revalidate windows.
    Custom,
}

/// Whether shared caches in front of the host may keep a copy.
///
/// This only affects the rendered [`CachingStrategy::cache_control`] directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl AsRef<str> for Visibility {
    fn as_ref(&self) -> &str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// How long a cached value is fresh, and how long it may be served stale afterwards.
///
/// Create strategies through the presets [`no_store`](Self::no_store), [`short`](Self::short),
/// [`long`](Self::long) and [`custom`](Self::custom), and fine-tune them with the `with_*`
/// methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingStrategy {
    pub mode: CacheMode,
    #[serde(default)]
    pub visibility: Visibility,
    /// Seconds the entry is considered fresh.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Additional time after `max_age` during which a stale value may be served while it is
    /// being revalidated in the background.
    #[serde(with = "humantime_serde")]
    pub stale_while_revalidate: Duration,
    /// Rendered as `s-maxage`, for shared caches in front of the host.
    #[serde(default, with = "humantime_serde")]
    pub s_max_age: Option<Duration>,
    /// Rendered as `stale-if-error`, for shared caches in front of the host.
    #[serde(default, with = "humantime_serde")]
    pub stale_if_error: Option<Duration>,
}

impl CachingStrategy {
    /// A strategy that bypasses the cache entirely.
    pub fn no_store() -> Self {
        Self {
            mode: CacheMode::NoStore,
            visibility: Visibility::Public,
            max_age: Duration::ZERO,
            stale_while_revalidate: Duration::ZERO,
            s_max_age: None,
            stale_if_error: None,
        }
    }

    /// Fresh for 1 second, then served stale for 9 more seconds.
    pub fn short() -> Self {
        Self {
            mode: CacheMode::Short,
            max_age: Duration::from_secs(1),
            stale_while_revalidate: Duration::from_secs(9),
            ..Self::no_store()
        }
    }

    /// Fresh for 1 hour, then served stale for 23 more hours.
    pub fn long() -> Self {
        Self {
            mode: CacheMode::Long,
            max_age: Duration::from_secs(3600),
            stale_while_revalidate: Duration::from_secs(23 * 3600),
            ..Self::no_store()
        }
    }

    /// Explicit freshness and stale windows.
    pub fn custom(max_age: Duration, stale_while_revalidate: Duration) -> Self {
        Self {
            mode: CacheMode::Custom,
            max_age,
            stale_while_revalidate,
            ..Self::no_store()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_stale_while_revalidate(mut self, stale_while_revalidate: Duration) -> Self {
        self.stale_while_revalidate = stale_while_revalidate;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_s_max_age(mut self, s_max_age: Duration) -> Self {
        self.s_max_age = Some(s_max_age);
        self
    }

    pub fn with_stale_if_error(mut self, stale_if_error: Duration) -> Self {
        self.stale_if_error = Some(stale_if_error);
        self
    }

    /// Whether this strategy bypasses the cache.
    pub fn is_no_store(&self) -> bool {
        self.mode == CacheMode::NoStore
    }

    /// The total time an entry stays servable, fresh or stale.
    ///
    /// Stores use this as the lifetime of an entry.
    pub fn stored_max_age(&self) -> Duration {
        self.max_age.saturating_add(self.stale_while_revalidate)
    }

    /// Renders this strategy as a `Cache-Control` header value.
    pub fn cache_control(&self) -> String {
        if self.is_no_store() {
            return "no-store".into();
        }

        let mut header = String::from(self.visibility.as_ref());
        let mut directive = |name: &str, value: Duration| {
            header
                .write_fmt(format_args!(", {name}={}", value.as_secs()))
                .unwrap();
        };
        directive("max-age", self.max_age);
        directive("stale-while-revalidate", self.stale_while_revalidate);
        if let Some(s_max_age) = self.s_max_age {
            directive("s-maxage", s_max_age);
        }
        if let Some(stale_if_error) = self.stale_if_error {
            directive("stale-if-error", stale_if_error);
        }
        header
    }
}

impl fmt::Display for CachingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_control())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let short = CachingStrategy::short();
        assert_eq!(short.max_age, Duration::from_secs(1));
        assert_eq!(short.stale_while_revalidate, Duration::from_secs(9));
        assert_eq!(short.stored_max_age(), Duration::from_secs(10));

        let long = CachingStrategy::long();
        assert_eq!(long.max_age, Duration::from_secs(3600));
        assert_eq!(long.stored_max_age(), Duration::from_secs(24 * 3600));

        assert!(CachingStrategy::no_store().is_no_store());
        assert!(!CachingStrategy::custom(Duration::ZERO, Duration::ZERO).is_no_store());
    }

    #[test]
    fn test_overrides_keep_mode() {
        let strategy = CachingStrategy::short()
            .with_max_age(Duration::from_secs(30))
            .with_visibility(Visibility::Private);
        assert_eq!(strategy.mode, CacheMode::Short);
        assert_eq!(strategy.max_age, Duration::from_secs(30));
        assert_eq!(strategy.stale_while_revalidate, Duration::from_secs(9));
    }

    #[test]
    fn test_cache_control() {
        insta::assert_snapshot!(
            CachingStrategy::short().cache_control(),
            @"public, max-age=1, stale-while-revalidate=9"
        );
        insta::assert_snapshot!(
            CachingStrategy::long()
                .with_visibility(Visibility::Private)
                .with_s_max_age(Duration::from_secs(60))
                .with_stale_if_error(Duration::from_secs(600))
                .cache_control(),
            @"private, max-age=3600, stale-while-revalidate=82800, s-maxage=60, stale-if-error=600"
        );
        insta::assert_snapshot!(CachingStrategy::no_store().to_string(), @"no-store");
    }

    #[test]
    fn test_deserialize() {
        let yaml = r#"
            mode: custom
            max_age: 1m
            stale_while_revalidate: 30s
        "#;
        let strategy: CachingStrategy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            strategy,
            CachingStrategy::custom(Duration::from_secs(60), Duration::from_secs(30))
        );

        let yaml = r#"
            mode: no-store
            max_age: 0s
            stale_while_revalidate: 0s
        "#;
        let strategy: CachingStrategy = serde_yaml::from_str(yaml).unwrap();
        assert!(strategy.is_no_store());
    }
}
