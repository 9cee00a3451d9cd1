//! Contract descriptions: the methods, properties and events an object exposes.
//!
//! A description is plain data shared by both sides. The server uses it to route
//! calls by `(name, arity)`, the client proxy uses it to decide between call,
//! notify and subscribe. Property accessors are addressed as operations named
//! `get_<property>` (no parameters) and `set_<property>` (one parameter).

use std::collections::HashSet;

use crate::error::ContractError;

/// Prefix of property read operations.
pub const GETTER_PREFIX: &str = "get_";
/// Prefix of property write operations.
pub const SETTER_PREFIX: &str = "set_";
/// Prefix of event attach members.
pub const ADD_PREFIX: &str = "add_";
/// Prefix of event detach members.
pub const REMOVE_PREFIX: &str = "remove_";
/// Member prefixes that can never be invoked remotely.
pub const RESERVED_PREFIXES: &[&str] = &["raise_", "op_"];

/// How an event's arguments are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventShape {
    /// Arguments are delivered as raised.
    Plain,
    /// A sender slot precedes the arguments; the receiving side fills it with its proxy.
    Standard,
}

/// A callable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescription {
    /// Operation name.
    pub name: String,
    /// Parameter count.
    pub arity: usize,
    /// Whether the caller never waits for completion.
    pub one_way: bool,
    /// Whether the operation produces a value.
    pub returns_value: bool,
}

/// A property exposed through accessor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescription {
    /// Property name.
    pub name: String,
    /// Has a `get_` accessor.
    pub readable: bool,
    /// Has a `set_` accessor.
    pub writable: bool,
    /// Writes are fire-and-forget.
    pub one_way: bool,
}

/// An event a client may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescription {
    /// Event name.
    pub name: String,
    /// Argument layout.
    pub shape: EventShape,
}

/// Which members a property exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// Getter only.
    ReadOnly,
    /// Setter only.
    WriteOnly,
    /// Getter and setter.
    ReadWrite,
}

impl PropertyAccess {
    const fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    const fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// The remotely visible surface of a hosted object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractDescription {
    name: String,
    methods: Vec<MethodDescription>,
    properties: Vec<PropertyDescription>,
    events: Vec<EventDescription>,
}

impl ContractDescription {
    /// Start describing a contract.
    pub fn builder(name: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Contract name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared methods, accessors excluded.
    #[must_use]
    pub fn methods(&self) -> &[MethodDescription] {
        &self.methods
    }

    /// Declared properties.
    #[must_use]
    pub fn properties(&self) -> &[PropertyDescription] {
        &self.properties
    }

    /// Declared events.
    #[must_use]
    pub fn events(&self) -> &[EventDescription] {
        &self.events
    }

    /// Look up a declared method.
    #[must_use]
    pub fn method(&self, name: &str, arity: usize) -> Option<&MethodDescription> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.arity == arity)
    }

    /// Look up a property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyDescription> {
        self.properties.iter().find(|property| property.name == name)
    }

    /// Look up an event.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<&EventDescription> {
        self.events.iter().find(|event| event.name == name)
    }

    /// Resolve an operation by name and arity, property accessors included.
    #[must_use]
    pub fn operation(&self, name: &str, arity: usize) -> Option<MethodDescription> {
        self.operations()
            .find(|operation| operation.name == name && operation.arity == arity)
    }

    /// Every callable operation: declared methods followed by property accessors.
    pub fn operations(&self) -> impl Iterator<Item = MethodDescription> + '_ {
        let accessors = self.properties.iter().flat_map(|property| {
            let getter = property.readable.then(|| MethodDescription {
                name: format!("{GETTER_PREFIX}{}", property.name),
                arity: 0,
                one_way: false,
                returns_value: true,
            });
            let setter = property.writable.then(|| MethodDescription {
                name: format!("{SETTER_PREFIX}{}", property.name),
                arity: 1,
                one_way: property.one_way,
                returns_value: false,
            });
            getter.into_iter().chain(setter)
        });
        self.methods.iter().cloned().chain(accessors)
    }
}

/// Builder for [`ContractDescription`]; duplicates are reported by [`ContractBuilder::build`].
#[derive(Debug, Clone)]
pub struct ContractBuilder {
    name: String,
    methods: Vec<MethodDescription>,
    properties: Vec<PropertyDescription>,
    events: Vec<EventDescription>,
}

impl ContractBuilder {
    /// Two-way method returning a value.
    #[must_use]
    pub fn method(self, name: impl Into<String>, arity: usize) -> Self {
        self.with_method(name.into(), arity, false, true)
    }

    /// Two-way method returning nothing.
    #[must_use]
    pub fn void_method(self, name: impl Into<String>, arity: usize) -> Self {
        self.with_method(name.into(), arity, false, false)
    }

    /// Fire-and-forget method.
    #[must_use]
    pub fn one_way_method(self, name: impl Into<String>, arity: usize) -> Self {
        self.with_method(name.into(), arity, true, false)
    }

    /// Property with two-way accessors.
    #[must_use]
    pub fn property(self, name: impl Into<String>, access: PropertyAccess) -> Self {
        self.with_property(name.into(), access, false)
    }

    /// Property whose setter is fire-and-forget.
    #[must_use]
    pub fn one_way_property(self, name: impl Into<String>, access: PropertyAccess) -> Self {
        self.with_property(name.into(), access, true)
    }

    /// Event.
    #[must_use]
    pub fn event(mut self, name: impl Into<String>, shape: EventShape) -> Self {
        self.events.push(EventDescription {
            name: name.into(),
            shape,
        });
        self
    }

    pub(crate) fn with_method(
        mut self,
        name: String,
        arity: usize,
        one_way: bool,
        returns_value: bool,
    ) -> Self {
        self.methods.push(MethodDescription {
            name,
            arity,
            one_way,
            returns_value,
        });
        self
    }

    pub(crate) fn with_property(
        mut self,
        name: String,
        access: PropertyAccess,
        one_way: bool,
    ) -> Self {
        self.properties.push(PropertyDescription {
            name,
            readable: access.readable(),
            writable: access.writable(),
            one_way,
        });
        self
    }

    /// Validate and seal the description.
    ///
    /// # Errors
    ///
    /// Fails when two operations share `(name, arity)` (accessors included), or two
    /// properties or two events share a name.
    pub fn build(self) -> Result<ContractDescription, ContractError> {
        let description = ContractDescription {
            name: self.name,
            methods: self.methods,
            properties: self.properties,
            events: self.events,
        };

        let mut names = HashSet::new();
        for property in &description.properties {
            if !names.insert(property.name.as_str()) {
                return Err(ContractError::DuplicateMember(property.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for event in &description.events {
            if !names.insert(event.name.as_str()) {
                return Err(ContractError::DuplicateMember(event.name.clone()));
            }
        }

        let mut signatures = HashSet::new();
        for operation in description.operations() {
            if !signatures.insert((operation.name.clone(), operation.arity)) {
                return Err(ContractError::AmbiguousOperation {
                    name: operation.name,
                    arity: operation.arity,
                });
            }
        }

        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> ContractDescription {
        ContractDescription::builder("Calculator")
            .method("Add", 2)
            .method("Add", 3)
            .one_way_method("Log", 1)
            .property("Precision", PropertyAccess::ReadWrite)
            .one_way_property("Label", PropertyAccess::WriteOnly)
            .event("ResultReady", EventShape::Standard)
            .build()
            .unwrap()
    }

    #[test]
    fn test_overloads_resolve_by_arity() {
        let contract = calculator();
        assert_eq!(contract.operation("Add", 2).unwrap().arity, 2);
        assert_eq!(contract.operation("Add", 3).unwrap().arity, 3);
        assert!(contract.operation("Add", 1).is_none());
    }

    #[test]
    fn test_accessors_are_operations() {
        let contract = calculator();

        let getter = contract.operation("get_Precision", 0).unwrap();
        assert!(getter.returns_value);
        assert!(!getter.one_way);

        let setter = contract.operation("set_Label", 1).unwrap();
        assert!(setter.one_way);
        assert!(contract.operation("get_Label", 0).is_none());
    }

    #[test]
    fn test_duplicate_signature_is_ambiguous() {
        let result = ContractDescription::builder("Broken")
            .method("Add", 2)
            .void_method("Add", 2)
            .build();
        assert!(matches!(
            result,
            Err(ContractError::AmbiguousOperation { arity: 2, .. })
        ));
    }

    #[test]
    fn test_method_clashing_with_accessor() {
        let result = ContractDescription::builder("Broken")
            .method("get_Name", 0)
            .property("Name", PropertyAccess::ReadOnly)
            .build();
        assert!(matches!(
            result,
            Err(ContractError::AmbiguousOperation { .. })
        ));
    }

    #[test]
    fn test_duplicate_event() {
        let result = ContractDescription::builder("Broken")
            .event("Changed", EventShape::Plain)
            .event("Changed", EventShape::Standard)
            .build();
        assert!(matches!(result, Err(ContractError::DuplicateMember(name)) if name == "Changed"));
    }
}
