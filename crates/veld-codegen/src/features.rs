//! Runtime-feature tracking.
//!
//! Records which runtime capabilities the program actually uses so
//! helper emission and the static/dynamic container decision can be
//! exact: minimal programs emit no helpers and link nothing.

use rustc_hash::FxHashSet;

/// A runtime capability the generated program depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Raw byte output (write syscall or WriteFile).
    PrintStr,
    /// Decimal formatting of float values, plus its scratch buffer.
    PrintNum,
    /// The external thread runtime backing the parallel loop form.
    ParallelMap,
}

/// The set of capabilities observed during codegen.
#[derive(Debug, Default)]
pub struct FeatureTracker {
    used: FxHashSet<Capability>,
    /// Call order of imported functions; determines symbol indices.
    imported_funcs: Vec<String>,
}

impl FeatureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, cap: Capability) {
        self.used.insert(cap);
    }

    pub fn uses(&self, cap: Capability) -> bool {
        self.used.contains(&cap)
    }

    /// Record a call to an externally-defined function. First-call
    /// order is preserved; repeated calls do not duplicate.
    pub fn record_import(&mut self, name: &str) {
        if !self.imported_funcs.iter().any(|f| f == name) {
            self.imported_funcs.push(name.to_string());
        }
    }

    pub fn imported_funcs(&self) -> &[String] {
        &self.imported_funcs
    }

    /// True when the output needs dynamic-linking metadata. Each
    /// codegen pass builds a fresh tracker, so the two-pass protocol
    /// observes an identical world without explicit resets.
    pub fn needs_dynamic(&self) -> bool {
        !self.imported_funcs.is_empty() || self.uses(Capability::ParallelMap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_program_needs_nothing() {
        let t = FeatureTracker::new();
        assert!(!t.needs_dynamic());
        assert!(!t.uses(Capability::PrintStr));
    }

    #[test]
    fn test_import_order_is_first_call_order() {
        let mut t = FeatureTracker::new();
        t.record_import("sin");
        t.record_import("cos");
        t.record_import("sin");
        assert_eq!(t.imported_funcs(), ["sin", "cos"]);
        assert!(t.needs_dynamic());
    }

    #[test]
    fn test_parallel_map_forces_dynamic() {
        let mut t = FeatureTracker::new();
        t.record(Capability::ParallelMap);
        assert!(t.needs_dynamic());
    }
}
