use core::str::FromStr;
use std::env;

/// When builtin type descriptors are synthesized.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum TypeInitPolicy {
    /// Every builtin type gets its native descriptor at startup.
    Eager,
    /// Only `object`, `type` and `tuple` are built at startup; everything
    /// else on first use.
    #[default]
    Lazy,
}

impl FromStr for TypeInitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "lazy" => Ok(Self::Lazy),
            other => Err(format!("unknown type init policy '{other}'")),
        }
    }
}

/// Bridge configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Settings {
    /// PYBRIDGE_TYPE_INIT=eager|lazy
    pub type_init: TypeInitPolicy,

    /// PYBRIDGE_DEBUG_REFCOUNT: trace every refcount change
    pub debug_refcount: bool,

    /// PYBRIDGE_DRAIN_ON_ALLOC: release dead links before each native allocation
    pub drain_on_alloc: bool,

    /// PYBRIDGE_WARN_SLOTS: report slots that could not be installed because
    /// the native descriptor has no sub-table for them
    pub warn_missing_slots: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            type_init: TypeInitPolicy::Lazy,
            debug_refcount: false,
            drain_on_alloc: true,
            warn_missing_slots: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.as_str() {
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => Some(true),
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overrides fields from `PYBRIDGE_*` environment variables that are set.
    pub fn with_env(mut self) -> Self {
        if let Ok(value) = env::var("PYBRIDGE_TYPE_INIT") {
            match value.parse() {
                Ok(policy) => self.type_init = policy,
                Err(err) => warn!("ignoring PYBRIDGE_TYPE_INIT: {err}"),
            }
        }
        if let Some(flag) = env_flag("PYBRIDGE_DEBUG_REFCOUNT") {
            self.debug_refcount = flag;
        }
        if let Some(flag) = env_flag("PYBRIDGE_DRAIN_ON_ALLOC") {
            self.drain_on_alloc = flag;
        }
        if let Some(flag) = env_flag("PYBRIDGE_WARN_SLOTS") {
            self.warn_missing_slots = flag;
        }
        self
    }

    pub fn with_type_init(mut self, policy: TypeInitPolicy) -> Self {
        self.type_init = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!("EAGER".parse(), Ok(TypeInitPolicy::Eager));
        assert_eq!("lazy".parse(), Ok(TypeInitPolicy::Lazy));
        assert!("sometimes".parse::<TypeInitPolicy>().is_err());
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default().with_type_init(TypeInitPolicy::Eager);
        assert_eq!(settings.type_init, TypeInitPolicy::Eager);
        assert!(settings.drain_on_alloc);
        assert!(!settings.debug_refcount);
    }
}
