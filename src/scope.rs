use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::value::Value;

pub type ScopeRef = Rc<RefCell<Scope>>;

/// One lexical environment: bindings plus named child modules, chained
/// through an optional parent. Scopes are shared handles because closures
/// and published modules keep them alive past the frame that created them.
pub struct Scope {
    pub parent: Option<ScopeRef>,
    pub bindings: BTreeMap<String, Value>,
    pub modules: BTreeMap<String, ScopeRef>,
}

impl Scope {
    pub fn root() -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            parent: None,
            bindings: BTreeMap::new(),
            modules: BTreeMap::new(),
        }))
    }

    pub fn child_of(parent: &ScopeRef) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            parent: Some(Rc::clone(parent)),
            bindings: BTreeMap::new(),
            modules: BTreeMap::new(),
        }))
    }

    /// Creates or overwrites a binding in this scope, shadowing any
    /// definition in an ancestor.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }
}

/// Reads a binding, walking parent scopes outward.
pub fn lookup(scope: &ScopeRef, name: &str) -> Result<Value> {
    let mut current = Rc::clone(scope);
    loop {
        let parent = {
            let scope = current.borrow();
            if let Some(value) = scope.bindings.get(name) {
                return Ok(value.clone());
            }
            scope.parent.clone()
        };
        match parent {
            Some(parent) => current = parent,
            None => bail!("Unbound identifier '{name}'"),
        }
    }
}

/// Writes through to the nearest scope that already has the name bound;
/// assigning a name that was never bound is an error.
pub fn assign(scope: &ScopeRef, name: &str, value: Value) -> Result<()> {
    let mut current = Rc::clone(scope);
    loop {
        let parent = {
            let mut scope = current.borrow_mut();
            if let Some(slot) = scope.bindings.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            scope.parent.clone()
        };
        match parent {
            Some(parent) => current = parent,
            None => bail!("Unbound identifier '{name}'"),
        }
    }
}

/// Resolves a qualified path like `a::b::c`: non-last segments name
/// modules, searched here and then in enclosing scopes; the last segment
/// is an ordinary binding lookup in the scope the path reached.
pub fn lookup_qualified(scope: &ScopeRef, path: &[String]) -> Result<Value> {
    let (head, rest) = match path {
        [only] => return lookup(scope, only),
        [head, rest @ ..] => (head, rest),
        [] => bail!("Unbound path ''"),
    };

    let mut current = Rc::clone(scope);
    loop {
        let parent = {
            let scope = current.borrow();
            if let Some(module) = scope.modules.get(head) {
                let module = Rc::clone(module);
                drop(scope);
                return lookup_qualified(&module, rest);
            }
            scope.parent.clone()
        };
        match parent {
            Some(parent) => current = parent,
            None => bail!("Unbound path '{}'", path.join("::")),
        }
    }
}

/// Publishes `module` as a child module of `parent`, moving its bindings
/// and submodules. A module published twice under one name merges, newer
/// bindings overwriting older ones.
pub fn publish_module(parent: &ScopeRef, name: &str, module: &ScopeRef) {
    let existing = parent.borrow().modules.get(name).cloned();
    match existing {
        Some(existing) => {
            let source = module.borrow();
            let mut target = existing.borrow_mut();
            for (key, value) in source.bindings.iter() {
                target.bindings.insert(key.clone(), value.clone());
            }
            for (key, submodule) in source.modules.iter() {
                target.modules.insert(key.clone(), Rc::clone(submodule));
            }
        }
        None => {
            parent
                .borrow_mut()
                .modules
                .insert(name.to_string(), Rc::clone(module));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parents_and_shadowing_wins() {
        let root = Scope::root();
        root.borrow_mut().bind("x", Value::Int(1));
        root.borrow_mut().bind("y", Value::Int(10));
        let child = Scope::child_of(&root);
        child.borrow_mut().bind("x", Value::Int(2));

        assert_eq!(lookup(&child, "x").expect("bound"), Value::Int(2));
        assert_eq!(lookup(&child, "y").expect("bound"), Value::Int(10));
        assert_eq!(lookup(&root, "x").expect("bound"), Value::Int(1));
    }

    #[test]
    fn lookup_of_unbound_name_fails_with_the_name() {
        let root = Scope::root();
        let err = lookup(&root, "missing").expect_err("expected failure");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn assign_writes_through_to_the_defining_scope() {
        let root = Scope::root();
        root.borrow_mut().bind("n", Value::Int(0));
        let child = Scope::child_of(&root);

        assign(&child, "n", Value::Int(5)).expect("assign should succeed");
        assert_eq!(lookup(&root, "n").expect("bound"), Value::Int(5));
        assert!(child.borrow().bindings.is_empty());
    }

    #[test]
    fn assign_to_unbound_name_fails() {
        let root = Scope::root();
        let err = assign(&root, "ghost", Value::Int(1)).expect_err("expected failure");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn qualified_lookup_descends_modules_and_ascends_parents() {
        let root = Scope::root();
        let module_a = Scope::root();
        let module_b = Scope::root();
        module_b.borrow_mut().bind("c", Value::Int(7));
        module_a
            .borrow_mut()
            .modules
            .insert("b".to_string(), module_b);
        root.borrow_mut().modules.insert("a".to_string(), module_a);

        let path: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let descendant = Scope::child_of(&Scope::child_of(&root));
        assert_eq!(
            lookup_qualified(&descendant, &path).expect("bound"),
            Value::Int(7)
        );

        let missing: Vec<String> = ["a", "z"].iter().map(|s| s.to_string()).collect();
        let err = lookup_qualified(&descendant, &missing).expect_err("expected failure");
        assert!(err.to_string().contains('z'));
    }

    #[test]
    fn duplicate_module_publication_overwrites_bindings() {
        let root = Scope::root();
        let first = Scope::root();
        first.borrow_mut().bind("version", Value::Int(1));
        first.borrow_mut().bind("kept", Value::Int(10));
        publish_module(&root, "m", &first);

        let second = Scope::root();
        second.borrow_mut().bind("version", Value::Int(2));
        publish_module(&root, "m", &second);

        let version: Vec<String> = ["m", "version"].iter().map(|s| s.to_string()).collect();
        let kept: Vec<String> = ["m", "kept"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            lookup_qualified(&root, &version).expect("bound"),
            Value::Int(2)
        );
        assert_eq!(lookup_qualified(&root, &kept).expect("bound"), Value::Int(10));
    }
}
