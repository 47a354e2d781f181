//! Registration of host-provided builtin functions.
//!
//! Builtins live in `::`-joined namespaces (`std::math::min`). Dangerous
//! functions additionally require a host confirmation callback before the
//! registry hands them out.

use carve_vm::Value;
use indexmap::IndexMap;

/// Accepted argument counts for a builtin function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterCount {
    None,
    Exactly(u32),
    AtLeast(u32),
    Between(u32, u32),
}

impl ParameterCount {
    /// Whether `count` arguments satisfy this constraint.
    pub fn allows(&self, count: u32) -> bool {
        match *self {
            ParameterCount::None => count == 0,
            ParameterCount::Exactly(n) => count == n,
            ParameterCount::AtLeast(n) => count >= n,
            ParameterCount::Between(lo, hi) => count >= lo && count <= hi,
        }
    }
}

/// A builtin implementation: takes evaluated arguments, may yield a value.
pub type FunctionCallback = Box<dyn FnMut(&[Value]) -> Option<Value>>;

pub(crate) struct BuiltinFunction {
    pub parameter_count: ParameterCount,
    pub callback: FunctionCallback,
    pub dangerous: bool,
}

/// The builtin function table plus the dangerous-call gate.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: IndexMap<String, BuiltinFunction>,
    dangerous_handler: Option<Box<dyn FnMut() -> bool>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a namespace path and a name into the canonical lookup key.
    pub fn full_name(namespace: &[String], name: &str) -> String {
        let mut full = String::new();
        for scope in namespace {
            full.push_str(scope);
            full.push_str("::");
        }
        full.push_str(name);
        full
    }

    /// Register a builtin. Returns false when the name was already taken
    /// (the existing registration wins).
    pub fn register(
        &mut self,
        namespace: &[String],
        name: &str,
        parameter_count: ParameterCount,
        callback: FunctionCallback,
        dangerous: bool,
    ) -> bool {
        let full = Self::full_name(namespace, name);
        if self.functions.contains_key(&full) {
            return false;
        }
        self.functions.insert(
            full,
            BuiltinFunction {
                parameter_count,
                callback,
                dangerous,
            },
        );
        true
    }

    /// Host callback asked before any dangerous function may run.
    pub fn set_dangerous_handler(&mut self, handler: Box<dyn FnMut() -> bool>) {
        self.dangerous_handler = Some(handler);
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.functions.contains_key(full_name)
    }

    pub fn parameter_count(&self, full_name: &str) -> Option<ParameterCount> {
        self.functions.get(full_name).map(|f| f.parameter_count)
    }

    /// Invoke a builtin. Dangerous functions consult the confirmation
    /// handler first and refuse without one.
    pub fn invoke(&mut self, full_name: &str, arguments: &[Value]) -> Option<Value> {
        let function = self.functions.get_mut(full_name)?;
        if !function.parameter_count.allows(arguments.len() as u32) {
            return None;
        }
        if function.dangerous {
            let confirmed = self
                .dangerous_handler
                .as_mut()
                .is_some_and(|handler| handler());
            if !confirmed {
                return None;
            }
        }
        (function.callback)(arguments)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn namespace_join() {
        assert_eq!(
            FunctionRegistry::full_name(&ns(&["std", "math"]), "min"),
            "std::math::min"
        );
        assert_eq!(FunctionRegistry::full_name(&[], "main"), "main");
    }

    #[test]
    fn parameter_count_constraints() {
        assert!(ParameterCount::None.allows(0));
        assert!(!ParameterCount::None.allows(1));
        assert!(ParameterCount::Exactly(2).allows(2));
        assert!(!ParameterCount::Exactly(2).allows(3));
        assert!(ParameterCount::AtLeast(1).allows(5));
        assert!(!ParameterCount::AtLeast(1).allows(0));
        assert!(ParameterCount::Between(1, 3).allows(2));
        assert!(!ParameterCount::Between(1, 3).allows(4));
    }

    #[test]
    fn registration_rejects_duplicates() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.register(
            &ns(&["std"]),
            "min",
            ParameterCount::Exactly(2),
            Box::new(|_| None),
            false,
        ));
        assert!(!registry.register(
            &ns(&["std"]),
            "min",
            ParameterCount::Exactly(2),
            Box::new(|_| None),
            false,
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("std::min"));
    }

    #[test]
    fn dangerous_functions_require_confirmation() {
        let mut registry = FunctionRegistry::new();
        registry.register(
            &[],
            "wipe",
            ParameterCount::None,
            Box::new(|_| None),
            true,
        );

        // no handler installed: refused
        assert!(registry.invoke("wipe", &[]).is_none());

        registry.set_dangerous_handler(Box::new(|| false));
        assert!(registry.invoke("wipe", &[]).is_none());

        let mut registry = FunctionRegistry::new();
        registry.register(
            &[],
            "wipe",
            ParameterCount::None,
            Box::new(|_| {
                Some(carve_vm::new_value(
                    carve_vm::ValueKind::Bool(true),
                    0,
                    0,
                    0,
                ))
            }),
            true,
        );
        registry.set_dangerous_handler(Box::new(|| true));
        assert!(registry.invoke("wipe", &[]).is_some());
    }

    #[test]
    fn invoke_checks_arity() {
        let mut registry = FunctionRegistry::new();
        registry.register(
            &[],
            "id",
            ParameterCount::Exactly(1),
            Box::new(|args| args.first().cloned()),
            false,
        );

        assert!(registry.invoke("id", &[]).is_none());
        let value = carve_vm::new_value(carve_vm::ValueKind::Unsigned(9), 0, 0, 0);
        assert!(registry.invoke("id", &[value]).is_some());
    }
}
