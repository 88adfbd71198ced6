use std::any::TypeId;
use std::collections::HashMap;

/// Simple name of a type: module path and generic arguments stripped.
///
/// - `my_app::events::Ping` → `Ping`
/// - `my_app::Envelope<my_app::Ping>` → `Envelope`
pub fn simple_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Maps in-process message types to wire discriminators.
///
/// The default wire type is the simple type name. Overrides are an explicit
/// table built at composition time:
/// - `rename::<T>()` pins a name to one type;
/// - `alias()` maps a default simple name to another wire name (the form
///   used by configuration files).
///
/// Type-keyed overrides win over aliases. Several types may share one
/// wire name; they are then indistinguishable on the wire.
#[derive(Debug, Clone, Default)]
pub struct WireTypeResolver {
    by_type: HashMap<TypeId, String>,
    by_name: HashMap<String, String>,
}

impl WireTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `T` to `wire` regardless of its own name.
    pub fn rename<T: ?Sized + 'static>(mut self, wire: impl Into<String>) -> Self {
        self.by_type.insert(TypeId::of::<T>(), wire.into());
        self
    }

    /// Resolve every type whose simple name is `simple_name` to `wire`.
    pub fn alias(mut self, simple_name: impl Into<String>, wire: impl Into<String>) -> Self {
        self.by_name.insert(simple_name.into(), wire.into());
        self
    }

    /// Wire type of `T`.
    pub fn resolve<T: ?Sized + 'static>(&self) -> &str {
        if let Some(wire) = self.by_type.get(&TypeId::of::<T>()) {
            return wire;
        }
        let simple = simple_name::<T>();
        self.by_name.get(simple).map(String::as_str).unwrap_or(simple)
    }

    /// Wire type of the value's type.
    pub fn resolve_of<T: ?Sized + 'static>(&self, _value: &T) -> &str {
        self.resolve::<T>()
    }
}
