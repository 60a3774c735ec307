//! Physical state declared through an explicit property layout.
//!
//! Every property has exactly one role. Sensed properties are read each
//! tick, actuated ones written each tick, and params read once to configure
//! the controller. A property may also carry a sanity predicate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{EmulationError, Result};
use crate::protocol::{PropValue, PropertyMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyRole {
    Sensed,
    Actuated,
    Param,
}

/// Returns `true` while the value is inside the valid operating envelope.
pub type SanityCheck = Box<dyn Fn(&PropValue) -> bool + Send + Sync>;

/// Frozen partition of a state's properties.
pub struct StateLayout {
    roles: BTreeMap<String, PropertyRole>,
    checks: BTreeMap<String, SanityCheck>,
    unrecorded: BTreeSet<String>,
}

impl StateLayout {
    pub fn builder() -> StateLayoutBuilder {
        StateLayoutBuilder::default()
    }

    pub fn role(&self, name: &str) -> Option<PropertyRole> {
        self.roles.get(name).copied()
    }

    fn with_role(&self, role: PropertyRole) -> impl Iterator<Item = &str> {
        self.roles
            .iter()
            .filter(move |(_, r)| **r == role)
            .map(|(n, _)| n.as_str())
    }

    pub fn sensed(&self) -> impl Iterator<Item = &str> {
        self.with_role(PropertyRole::Sensed)
    }

    pub fn actuated(&self) -> impl Iterator<Item = &str> {
        self.with_role(PropertyRole::Actuated)
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.with_role(PropertyRole::Param)
    }

    pub fn is_actuated(&self, name: &str) -> bool {
        self.role(name) == Some(PropertyRole::Actuated)
    }

    pub fn is_sensed(&self, name: &str) -> bool {
        self.role(name) == Some(PropertyRole::Sensed)
    }

    /// Sensed and actuated properties that go into the simulation record.
    pub fn recorded(&self) -> impl Iterator<Item = &str> {
        self.roles
            .iter()
            .filter(|(n, r)| **r != PropertyRole::Param && !self.unrecorded.contains(*n))
            .map(|(n, _)| n.as_str())
    }

    pub fn checks(&self) -> impl Iterator<Item = (&str, &SanityCheck)> {
        self.checks.iter().map(|(n, c)| (n.as_str(), c))
    }
}

impl fmt::Debug for StateLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLayout")
            .field("roles", &self.roles)
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .field("unrecorded", &self.unrecorded)
            .finish()
    }
}

#[derive(Default)]
pub struct StateLayoutBuilder {
    declared: Vec<(String, PropertyRole)>,
    checks: Vec<(String, SanityCheck)>,
    unrecorded: Vec<String>,
}

impl StateLayoutBuilder {
    fn declare(mut self, name: impl Into<String>, role: PropertyRole) -> Self {
        self.declared.push((name.into(), role));
        self
    }

    pub fn sensed(self, name: impl Into<String>) -> Self {
        self.declare(name, PropertyRole::Sensed)
    }

    pub fn actuated(self, name: impl Into<String>) -> Self {
        self.declare(name, PropertyRole::Actuated)
    }

    pub fn param(self, name: impl Into<String>) -> Self {
        self.declare(name, PropertyRole::Param)
    }

    pub fn checked<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&PropValue) -> bool + Send + Sync + 'static,
    {
        self.checks.push((name.into(), Box::new(check)));
        self
    }

    /// Keeps a declared property out of the simulation record.
    pub fn unrecorded(mut self, name: impl Into<String>) -> Self {
        self.unrecorded.push(name.into());
        self
    }

    pub fn build(self) -> Result<StateLayout> {
        let mut roles = BTreeMap::new();
        for (name, role) in self.declared {
            match roles.get(&name) {
                Some(existing) if *existing != role => {
                    return Err(EmulationError::ConflictingRole(name));
                }
                Some(_) => {}
                None => {
                    roles.insert(name, role);
                }
            }
        }

        let mut checks = BTreeMap::new();
        for (name, check) in self.checks {
            if !roles.contains_key(&name) {
                return Err(EmulationError::UnknownProperty(name));
            }
            checks.insert(name, check);
        }

        let mut unrecorded = BTreeSet::new();
        for name in self.unrecorded {
            if !roles.contains_key(&name) {
                return Err(EmulationError::UnknownProperty(name));
            }
            unrecorded.insert(name);
        }

        Ok(StateLayout {
            roles,
            checks,
            unrecorded,
        })
    }
}

/// A physical model advanced by the plant once per tick.
///
/// Implementors provide the layout, raw get/set and `advance`; the role-based
/// views are derived from the layout.
pub trait State: Send {
    fn layout(&self) -> &StateLayout;

    fn get(&self, name: &str) -> Option<PropValue>;

    /// Writes an actuated property. Only called for names the layout marks
    /// as actuated.
    fn set(&mut self, name: &str, value: PropValue);

    /// Steps the model forward by `delta_t` seconds.
    fn advance(&mut self, delta_t: f64);

    fn initialize(&mut self) {}

    fn shutdown(&mut self) {}

    fn get_sensed(&self) -> PropertyMap {
        collect(self, self.layout().sensed())
    }

    fn get_actuated(&self) -> PropertyMap {
        collect(self, self.layout().actuated())
    }

    fn get_controller_params(&self) -> PropertyMap {
        collect(self, self.layout().params())
    }

    fn get_recorded(&self) -> PropertyMap {
        collect(self, self.layout().recorded())
    }

    /// Properties whose sanity check fails, with their current values. A
    /// checked property the state cannot produce fails with a NaN value.
    fn check_sanity(&self) -> PropertyMap {
        self.layout()
            .checks()
            .filter_map(|(name, check)| match self.get(name) {
                Some(value) => (!check(&value)).then(|| (name.to_owned(), value)),
                None => Some((name.to_owned(), PropValue::Float(f64::NAN))),
            })
            .collect()
    }
}

fn collect<'a, S: State + ?Sized>(
    state: &S,
    names: impl Iterator<Item = &'a str>,
) -> PropertyMap {
    names
        .filter_map(|n| state.get(n).map(|v| (n.to_owned(), v)))
        .collect()
}
