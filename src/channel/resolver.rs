//! Bind local signals to the leaves of a remote value tree
//!
//! The walk rebuilds, for every leaf, the name a local signal would have if it
//! addressed that leaf: member names are joined with `.` and leaves directly
//! inside an element of a structure array get an `[index]` suffix. Any signal
//! whose qualified name matches is bound to the leaf's [`FieldPath`].
//!
//! Elements of a structure array share the array's name, so only a single level
//! of structure array produces distinct names. Structures nested inside array
//! elements (or arrays of arrays) map several leaves onto the same name, and the
//! last one visited wins.

use tracing::{debug, trace};

use crate::{
    pvdata::{FieldPath, PathStep, PvField, PvStructure},
    signal::CachedSignal,
};

/// Leaf assignments for each signal of a channel, in signal-table order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings(Vec<Option<FieldPath>>);

impl Bindings {
    pub fn unbound(count: usize) -> Self {
        Bindings(vec![None; count])
    }

    pub fn get(&self, index: usize) -> Option<&FieldPath> {
        self.0.get(index).and_then(|b| b.as_ref())
    }

    pub fn bound_count(&self) -> usize {
        self.0.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    /// Declared names of every signal without a leaf
    pub fn unbound_names(&self, signals: &[CachedSignal]) -> Vec<String> {
        self.0
            .iter()
            .zip(signals)
            .filter(|(b, _)| b.is_none())
            .map(|(_, s)| s.declared_name().to_string())
            .collect()
    }

    fn clear(&mut self, count: usize) {
        self.0.clear();
        self.0.resize(count, None);
    }
}

/// Walk `root` and bind every signal whose qualified name matches a leaf
///
/// Previous bindings are discarded. Returns false only if there is no root to
/// walk; leaves without a signal, and signals without a leaf, are not errors.
pub fn resolve(
    root: Option<&PvStructure>,
    signals: &[CachedSignal],
    bindings: &mut Bindings,
) -> bool {
    bindings.clear(signals.len());
    let Some(root) = root else {
        return false;
    };
    visit_structure(root, "", FieldPath::root(), None, signals, bindings);
    debug!(
        "Resolved {} of {} signals",
        bindings.bound_count(),
        signals.len()
    );
    true
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Visit every member of a structure
///
/// `element` is set when this structure is an element of a structure array.
fn visit_structure(
    structure: &PvStructure,
    prefix: &str,
    path: FieldPath,
    element: Option<usize>,
    signals: &[CachedSignal],
    bindings: &mut Bindings,
) {
    for (index, (name, field)) in structure.fields().enumerate() {
        let field_path = path.child(PathStep::Field(index));
        let name = join(prefix, name);
        match field {
            PvField::Structure(inner) => {
                visit_structure(inner, &name, field_path, None, signals, bindings)
            }
            PvField::StructureArray(elements) => {
                for (e, inner) in elements.iter().enumerate() {
                    visit_structure(
                        inner,
                        &name,
                        field_path.child(PathStep::Element(e)),
                        Some(e),
                        signals,
                        bindings,
                    );
                }
            }
            PvField::Scalar(_) | PvField::ScalarArray(_) => {
                let name = match element {
                    Some(e) => format!("{name}[{e}]"),
                    None => name,
                };
                bind_leaf(&name, field_path, signals, bindings);
            }
        }
    }
}

fn bind_leaf(name: &str, path: FieldPath, signals: &[CachedSignal], bindings: &mut Bindings) {
    let Some(index) = signals.iter().position(|s| s.qualified_name() == name) else {
        trace!("No signal for leaf {name}");
        return;
    };
    if bindings.0[index].is_some() {
        debug!("Leaf name {name} is ambiguous, rebinding to the last occurrence");
    }
    bindings.0[index] = Some(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pvdata::ScalarType,
        signal::{CachedSignal, SignalMemory},
    };

    fn signal(name: &str) -> CachedSignal {
        CachedSignal::new(name, name, SignalMemory::new(ScalarType::U32, 1))
    }

    #[test]
    fn binds_nested_leaves() {
        let root = PvStructure::new("").with(
            "value",
            PvStructure::new("")
                .with("NodeA", PvStructure::new("").with("Element1", 1u32))
                .with("Other", 2u32),
        );
        let signals = vec![
            signal("value.NodeA.Element1"),
            signal("value.Missing"),
            signal("value.Other"),
        ];
        let mut bindings = Bindings::default();
        assert!(resolve(Some(&root), &signals, &mut bindings));
        assert_eq!(bindings.bound_count(), 2);
        assert_eq!(
            root.get(bindings.get(0).unwrap()),
            Some(&PvField::from(1u32))
        );
        assert!(bindings.get(1).is_none());
        assert_eq!(
            root.get(bindings.get(2).unwrap()),
            Some(&PvField::from(2u32))
        );
        assert_eq!(bindings.unbound_names(&signals), vec!["value.Missing"]);
        assert!(!bindings.is_complete());
    }

    #[test]
    fn structure_array_elements_are_indexed() {
        let root = PvStructure::new("").with(
            "value",
            vec![
                PvStructure::new("").with("x", 10u32),
                PvStructure::new("").with("x", 20u32),
            ],
        );
        let signals = vec![signal("value.x[1]"), signal("value.x[0]")];
        let mut bindings = Bindings::default();
        assert!(resolve(Some(&root), &signals, &mut bindings));
        assert_eq!(
            root.get(bindings.get(0).unwrap()),
            Some(&PvField::from(20u32))
        );
        assert_eq!(
            root.get(bindings.get(1).unwrap()),
            Some(&PvField::from(10u32))
        );
    }

    #[test]
    fn nested_structure_in_array_is_ambiguous() {
        let element = |v: u32| PvStructure::new("").with("inner", PvStructure::new("").with("y", v));
        let root = PvStructure::new("").with("value", vec![element(1), element(2)]);
        let signals = vec![signal("value.inner.y")];
        let mut bindings = Bindings::default();
        assert!(resolve(Some(&root), &signals, &mut bindings));
        assert_eq!(
            root.get(bindings.get(0).unwrap()),
            Some(&PvField::from(2u32))
        );
    }

    #[test]
    fn resolving_is_repeatable() {
        let root = PvStructure::new("").with("value", 1u32);
        let signals = vec![signal("value")];
        let mut first = Bindings::default();
        let mut second = Bindings::default();
        assert!(resolve(Some(&root), &signals, &mut first));
        assert!(resolve(Some(&root), &signals, &mut second));
        assert_eq!(first, second);
        assert!(resolve(Some(&root), &signals, &mut first));
        assert_eq!(first, second);
    }

    #[test]
    fn missing_root() {
        let signals = vec![signal("value")];
        let mut bindings = Bindings::default();
        assert!(!resolve(None, &signals, &mut bindings));
        assert_eq!(bindings.bound_count(), 0);
        assert_eq!(bindings.unbound_names(&signals).len(), 1);
    }
}
