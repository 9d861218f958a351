use std::sync::Arc;

use resclient_core::{Pattern, Rid};

/// Factory constructing the application-visible object for a RID.
pub type Factory<T> = Arc<dyn Fn(&Rid) -> T + Send + Sync>;

/// Pattern-keyed registry of resource factories, one per resource kind.
///
/// Patterns use the resource-ID glob syntax (`*` matches one segment, a
/// trailing `>` matches the rest). When several patterns match a RID the
/// most specific one wins; the registry falls back to its default
/// factory when none match.
pub(crate) struct TypeList<T> {
    entries: Vec<(Pattern, Factory<T>)>,
    default: Factory<T>,
}

impl<T> TypeList<T> {
    pub(crate) fn new(default: Factory<T>) -> Self {
        Self { entries: Vec::new(), default }
    }

    /// Registers a factory, replacing any previous entry for the same
    /// pattern.
    pub(crate) fn register(&mut self, pattern: Pattern, factory: Factory<T>) {
        if let Some(entry) = self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            entry.1 = factory;
        } else {
            self.entries.push((pattern, factory));
        }
    }

    /// Removes the entry for the pattern. Returns false if there was
    /// none.
    pub(crate) fn unregister(&mut self, pattern: &Pattern) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(p, _)| p != pattern);
        self.entries.len() < before
    }

    /// The factory for the RID: most specific matching pattern, or the
    /// default.
    pub(crate) fn factory(&self, rid: &Rid) -> &Factory<T> {
        let mut best: Option<&(Pattern, Factory<T>)> = None;
        for entry in &self.entries {
            if !entry.0.matches(rid) {
                continue;
            }
            match best {
                Some(b) if !entry.0.more_specific_than(&b.0) => {}
                _ => best = Some(entry),
            }
        }
        best.map(|(_, f)| f).unwrap_or(&self.default)
    }
}
