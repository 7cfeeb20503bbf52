use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::shared_str::SharedStr;

/// Identity of a profiled function: equal by name and owning module.
///
/// Both parts are [`SharedStr`]s, so cloning a `Function` is two refcount
/// bumps. Functions handed out by a [`FunctionTable`] share their name
/// allocations, which keeps equality checks on the pointer fast path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Function {
    name: SharedStr,
    module: SharedStr,
}

impl Function {
    pub fn new(name: impl Into<SharedStr>, module: impl Into<SharedStr>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
        }
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn module(&self) -> &SharedStr {
        &self.module
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.module, self.name)
    }
}

/// Debug-info metadata attached to a function by the symbol resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDebugInfo {
    pub name: SharedStr,
    /// Relative virtual address of the function start within its module.
    pub rva: u64,
    pub size: u64,
}

impl FunctionDebugInfo {
    pub fn new(name: impl Into<SharedStr>, rva: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            rva,
            size,
        }
    }
}

/// Session-wide interner for function and module names.
///
/// Safe to share between ingestion workers.
#[derive(Debug, Default)]
pub struct FunctionTable {
    names: DashSet<SharedStr>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the interned copy of `name`, inserting it on first use.
    pub fn intern(&self, name: &str) -> SharedStr {
        if let Some(existing) = self.names.get(name) {
            return existing.key().clone();
        }
        let interned = SharedStr::from(name);
        // Another worker may have won the race; keep whichever copy landed.
        if !self.names.insert(interned.clone())
            && let Some(existing) = self.names.get(name)
        {
            return existing.key().clone();
        }
        interned
    }

    pub fn function(&self, name: &str, module: &str) -> Function {
        Function {
            name: self.intern(name),
            module: self.intern(module),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_name_and_module() {
        let a = Function::new("Parse", "app.exe");
        let b = Function::new("Parse", "app.exe");
        let c = Function::new("Parse", "lib.dll");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn interned_functions_share_names() {
        let table = FunctionTable::new();
        let a = table.function("main", "app.exe");
        let b = table.function("main", "app.exe");
        assert!(a.name().ptr_eq(b.name()));
        assert!(a.module().ptr_eq(b.module()));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn display_uses_module_bang_name() {
        let f = Function::new("RtlUserThreadStart", "ntdll.dll");
        assert_eq!(f.to_string(), "ntdll.dll!RtlUserThreadStart");
    }
}
