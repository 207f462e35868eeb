//! Agent registry - slug-keyed catalogue of matching and export agents.
//!
//! Directors resolve the agent for a loyalty scheme (matching) or destination
//! provider (export) by slug. A miss is a typed [`RegistryError::NotRegistered`]
//! which the caller treats as a configuration fault: usually a scheme that is
//! not yet enabled, so the work item is skipped with a warning.
//!
//! Insertion order is preserved in [`AgentRegistry::slugs`] so that status
//! output and logs are deterministic.

use std::sync::Arc;

use crate::error::RegistryError;

struct RegistryEntry<A: ?Sized> {
    slug: String,
    agent: Arc<A>,
}

/// Catalogue of agents keyed by slug. Slugs are compared case-sensitively.
pub struct AgentRegistry<A: ?Sized> {
    entries: Vec<RegistryEntry<A>>,
}

impl<A: ?Sized> AgentRegistry<A> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `agent` under `slug`.
    ///
    /// # Errors
    /// - [`RegistryError::EmptySlug`] if `slug` is empty/whitespace.
    /// - [`RegistryError::DuplicateSlug`] if `slug` is already registered.
    pub fn register(&mut self, slug: impl Into<String>, agent: Arc<A>) -> Result<(), RegistryError> {
        let slug = slug.into();
        if slug.trim().is_empty() {
            return Err(RegistryError::EmptySlug);
        }
        if self.contains(&slug) {
            return Err(RegistryError::DuplicateSlug { slug });
        }
        self.entries.push(RegistryEntry { slug, agent });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, slug: impl Into<String>, agent: Arc<A>) -> Result<Self, RegistryError> {
        self.register(slug, agent)?;
        Ok(self)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.entries.iter().any(|e| e.slug == slug)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered slugs in insertion order.
    pub fn slugs(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.slug.as_str()).collect()
    }

    /// # Errors
    /// [`RegistryError::NotRegistered`] if no agent is registered for `slug`.
    pub fn get(&self, slug: &str) -> Result<Arc<A>, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.slug == slug)
            .map(|e| Arc::clone(&e.agent))
            .ok_or_else(|| RegistryError::NotRegistered {
                slug: slug.to_string(),
            })
    }
}

impl<A: ?Sized> Default for AgentRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &'static str;
    }

    struct Alpha;
    impl Named for Alpha {
        fn name(&self) -> &'static str {
            "alpha"
        }
    }

    struct Beta;
    impl Named for Beta {
        fn name(&self) -> &'static str {
            "beta"
        }
    }

    #[test]
    fn lookup_by_slug() {
        let mut reg: AgentRegistry<dyn Named> = AgentRegistry::new();
        reg.register("iceland", Arc::new(Alpha)).unwrap();
        reg.register("wasabi", Arc::new(Beta)).unwrap();

        assert_eq!(reg.get("wasabi").unwrap().name(), "beta");
        assert_eq!(reg.slugs(), vec!["iceland", "wasabi"]);
    }

    #[test]
    fn unknown_slug_is_not_registered() {
        let reg: AgentRegistry<dyn Named> = AgentRegistry::new();
        let err = reg.get("nope").err().unwrap();
        assert_eq!(
            err,
            RegistryError::NotRegistered {
                slug: "nope".to_string()
            }
        );
    }

    #[test]
    fn duplicate_and_empty_slugs_are_rejected() {
        let mut reg: AgentRegistry<dyn Named> = AgentRegistry::new();
        reg.register("iceland", Arc::new(Alpha)).unwrap();
        assert_eq!(
            reg.register("iceland", Arc::new(Beta)),
            Err(RegistryError::DuplicateSlug {
                slug: "iceland".to_string()
            })
        );
        assert_eq!(reg.register("  ", Arc::new(Beta)), Err(RegistryError::EmptySlug));
        assert_eq!(reg.len(), 1);
    }
}
