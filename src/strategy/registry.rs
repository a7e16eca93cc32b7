//! Named constructors of selection algorithms and membership policies.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use super::{
    BoundChooser, FewestPending, Membership, PeerList, RandomPeer, RoundRobin, StaticMembership,
    FEWEST_PENDING, RANDOM, ROUND_ROBIN, STATIC,
};
use crate::config::ClientGroup;
use crate::peer::BenchTransport;
use crate::{Error, Result};

/// Builds a selection algorithm on top of a stub transport.
pub type StrategyConstructor = Arc<dyn Fn(BenchTransport) -> Box<dyn PeerList> + Send + Sync>;

/// Builds a membership policy for a population of `peer_count` servers.
pub type MembershipConstructor =
    Arc<dyn Fn(usize) -> Result<Box<dyn Membership>> + Send + Sync>;

struct Registry<C> {
    kind: &'static str,
    constructors: HashMap<String, C>,
}

impl<C: Clone> Registry<C> {
    fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            constructors: HashMap::new(),
        }
    }

    fn register(&mut self, name: String, constructor: C) -> Result<()> {
        if name.is_empty() {
            return Err(Error::EmptyName { kind: self.kind });
        }
        if self.constructors.contains_key(&name) {
            return Err(Error::DuplicateRegistration {
                kind: self.kind,
                name,
            });
        }

        self.constructors.insert(name, constructor);

        Ok(())
    }

    fn get(&self, name: &str) -> Option<C> {
        self.constructors.get(name).cloned()
    }

    fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Two independent registries, selection strategies and membership policies.
///
/// Created per benchmark and passed explicitly, there is no global registry.
pub struct StrategyRegistry {
    strategies: Registry<StrategyConstructor>,
    memberships: Registry<MembershipConstructor>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        StrategyRegistry {
            strategies: Registry::new("Strategy"),
            memberships: Registry::new("Membership"),
        }
    }

    /// Register a selection algorithm under `name`.
    ///
    /// Fails if `name` is empty or already registered.
    pub fn register_strategy<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(BenchTransport) -> Box<dyn PeerList> + Send + Sync + 'static,
    {
        self.strategies
            .register(name.to_string(), strategy(constructor))
    }

    /// Register a membership policy under `name`.
    ///
    /// Fails if `name` is empty or already registered.
    pub fn register_membership<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(usize) -> Result<Box<dyn Membership>> + Send + Sync + 'static,
    {
        self.memberships
            .register(name.to_string(), membership(constructor))
    }

    pub fn strategy(&self, name: &str) -> Option<StrategyConstructor> {
        self.strategies.get(name)
    }

    pub fn membership(&self, name: &str) -> Option<MembershipConstructor> {
        self.memberships.get(name)
    }

    /// Registered strategy names, sorted.
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.names()
    }

    /// Registered membership names, sorted.
    pub fn membership_names(&self) -> Vec<&str> {
        self.memberships.names()
    }

    /// Check that every name `group` refers to is registered, reporting all that are not.
    pub fn check(&self, group: &ClientGroup) -> Vec<Error> {
        let mut errors = Vec::new();

        if self.strategy(&group.strategy).is_none() {
            errors.push(Error::UnknownStrategy(group.strategy.clone()));
        }
        if self.membership(&group.membership).is_none() {
            errors.push(Error::UnknownMembership(group.membership.clone()));
        }

        errors
    }

    /// Build an unstarted chooser for a client of `group`.
    pub fn bound_chooser(&self, group: &ClientGroup, peer_count: usize) -> Result<BoundChooser> {
        let strategy = self
            .strategy(&group.strategy)
            .ok_or_else(|| Error::UnknownStrategy(group.strategy.clone()))?;
        let membership = self
            .membership(&group.membership)
            .ok_or_else(|| Error::UnknownMembership(group.membership.clone()))?;

        Ok(BoundChooser::new(
            strategy(BenchTransport::new()),
            membership(peer_count)?,
        ))
    }
}

impl Default for StrategyRegistry {
    /// Registry with the built-in strategies and the static membership.
    fn default() -> Self {
        let mut registry = StrategyRegistry::new();

        let builtin = [
            (ROUND_ROBIN, strategy(|t| Box::new(RoundRobin::new(t)))),
            (FEWEST_PENDING, strategy(|t| Box::new(FewestPending::new(t)))),
            (RANDOM, strategy(|t| Box::new(RandomPeer::new(t)))),
        ];
        for (name, constructor) in builtin.iter().cloned() {
            registry
                .strategies
                .constructors
                .insert(name.to_string(), constructor);
        }

        registry.memberships.constructors.insert(
            STATIC.to_string(),
            membership(|peer_count| Ok(Box::new(StaticMembership::new(peer_count)))),
        );

        registry
    }
}

fn strategy<F>(constructor: F) -> StrategyConstructor
where
    F: Fn(BenchTransport) -> Box<dyn PeerList> + Send + Sync + 'static,
{
    Arc::new(constructor)
}

fn membership<F>(constructor: F) -> MembershipConstructor
where
    F: Fn(usize) -> Result<Box<dyn Membership>> + Send + Sync + 'static,
{
    Arc::new(constructor)
}

impl Debug for StrategyRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.strategy_names())
            .field("memberships", &self.membership_names())
            .finish()
    }
}
