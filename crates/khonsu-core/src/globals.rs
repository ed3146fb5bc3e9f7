/// Registry of global names seen by the compiler.
///
/// Whenever compiled code reads or writes a global, the name is recorded
/// here, in first-reference order. The runtime uses this to pre-create
/// global-table entries and to report undefined-global diagnostics.
use crate::string::StringId;
use indexmap::IndexSet;

#[derive(Debug, Default)]
pub struct GlobalRegistry {
    names: IndexSet<StringId>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        GlobalRegistry {
            names: IndexSet::new(),
        }
    }

    /// Note that `name` is referenced as a global. Idempotent.
    pub fn note(&mut self, name: StringId) {
        self.names.insert(name);
    }

    pub fn contains(&self, name: StringId) -> bool {
        self.names.contains(&name)
    }

    /// Names in first-reference order.
    pub fn iter(&self) -> impl Iterator<Item = StringId> + '_ {
        self.names.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
