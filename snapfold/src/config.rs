//! Store and projection configuration.
//!
//! Everything here is fixed before any event flows. Registration validation
//! is deliberately eager: a misconfigured projection fails the build step,
//! never a runtime fold.

use std::collections::HashSet;

use crate::errors::{ConfigError, ConfigResult};
use crate::types::IdentityScheme;

/// How the store partitions data across tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenancyStyle {
    /// One tenant; all sessions share the default tenant.
    Single,
    /// Many tenants sharing one store, partitioned by tenant id.
    Conjoined,
}

/// When and how durably a projection's fold results are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionLifecycle {
    /// Folded in the same transaction that appends the triggering events.
    Inline,
    /// Folded on demand per query; results are never persisted.
    Live,
    /// Folded by the background daemon, tracked by per-shard progress.
    Async,
}

/// Whether a projection's snapshot table is tenant-partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionScope {
    /// One snapshot table per tenant.
    Tenanted,
    /// One shared snapshot table, regardless of which tenant appended.
    Global,
}

/// Store-wide configuration, fixed at build time.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// The single identity scheme every stream in the store uses.
    pub identity_scheme: IdentityScheme,
    /// Tenancy partitioning style.
    pub tenancy: TenancyStyle,
    /// Capacity for the per-projection snapshot cache. Zero disables it.
    pub snapshot_cache_capacity: usize,
}

impl StoreConfig {
    /// A single-tenant store with string-keyed streams and no caching.
    pub const fn new(identity_scheme: IdentityScheme) -> Self {
        Self {
            identity_scheme,
            tenancy: TenancyStyle::Single,
            snapshot_cache_capacity: 0,
        }
    }

    /// Switches the store to conjoined multi-tenancy.
    #[must_use]
    pub const fn conjoined(mut self) -> Self {
        self.tenancy = TenancyStyle::Conjoined;
        self
    }

    /// Sets the snapshot cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_cache_capacity = capacity;
        self
    }
}

/// The declaration of one projection against the store.
#[derive(Debug, Clone)]
pub struct ProjectionRegistration {
    /// Unique projection name; also the async shard name prefix.
    pub name: String,
    /// The lifecycle the projection runs under.
    pub lifecycle: ProjectionLifecycle,
    /// Tenant scoping of the materialized table.
    pub scope: ProjectionScope,
    /// Optional event-type allow-list. Purely an optimization; an empty
    /// filter means "all types".
    pub event_filter: HashSet<&'static str>,
}

impl ProjectionRegistration {
    /// Declares a projection under the given lifecycle.
    pub fn new(name: impl Into<String>, lifecycle: ProjectionLifecycle) -> Self {
        Self {
            name: name.into(),
            lifecycle,
            scope: ProjectionScope::Tenanted,
            event_filter: HashSet::new(),
        }
    }

    /// Makes the projection's table shared across tenants.
    #[must_use]
    pub fn global(mut self) -> Self {
        self.scope = ProjectionScope::Global;
        self
    }

    /// Restricts the events the projection sees to the listed types.
    #[must_use]
    pub fn filter_events(mut self, types: &[&'static str]) -> Self {
        self.event_filter.extend(types.iter().copied());
        self
    }

    /// Whether the projection wants this event type.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_filter.is_empty() || self.event_filter.contains(event_type)
    }

    /// Structural validation, run when the registration joins a store.
    ///
    /// # Errors
    ///
    /// Rejects empty names and global inline projections on a single-tenant
    /// store (the scope would be meaningless and hints at a misdeclared
    /// registration).
    pub fn validate(&self, tenancy: TenancyStyle) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidRegistration {
                projection: self.name.clone(),
                reason: "projection name must not be empty".to_string(),
            });
        }
        if self.scope == ProjectionScope::Global && tenancy == TenancyStyle::Single {
            return Err(ConfigError::InvalidRegistration {
                projection: self.name.clone(),
                reason: "global scope requires a multi-tenant store".to_string(),
            });
        }
        Ok(())
    }
}
