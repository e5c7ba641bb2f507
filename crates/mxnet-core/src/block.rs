//! Named parameters and symbol/parameter bundles.

use std::sync::Arc;

use crate::cached_op::{CachedOp, CachedOpBuilder, ParameterPlacement};
use crate::manager::NdManager;
use crate::ndarray::NdArray;
use crate::symbol::Symbol;
use crate::{MxError, Result};

/// Ordered set of named arrays; names are unique.
#[derive(Clone, Debug, Default)]
pub struct ParameterSet {
    entries: Vec<(String, Arc<NdArray>)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. Fails if `name` is already present.
    pub fn insert(&mut self, name: impl Into<String>, array: impl Into<Arc<NdArray>>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(MxError::InvalidArgument(format!("duplicate parameter name {name}")));
        }
        self.entries.push((name, array.into()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NdArray>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<NdArray>> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<NdArray>)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a))
    }
}

/// A graph together with the parameters it was trained with.
#[derive(Debug)]
pub struct SymbolBlock {
    symbol: Symbol,
    parameters: ParameterSet,
    placement: ParameterPlacement,
}

impl SymbolBlock {
    pub fn new(symbol: Symbol, parameters: ParameterSet) -> Self {
        Self {
            symbol,
            parameters,
            placement: ParameterPlacement::default(),
        }
    }

    pub fn with_placement(mut self, placement: ParameterPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    /// Graph inputs left for the caller to supply.
    pub fn runtime_input_names(&self) -> Result<Vec<String>> {
        Ok(self
            .symbol
            .all_names()?
            .iter()
            .filter(|n| !self.parameters.contains(n))
            .cloned()
            .collect())
    }

    pub fn cached_op_builder(&self, manager: &NdManager) -> CachedOpBuilder<'_> {
        CachedOpBuilder::new(&self.symbol, manager)
            .parameters(&self.parameters)
            .placement(self.placement)
    }

    /// Build a cached operator with this block's parameters bound.
    pub fn cached_op(&self, manager: &NdManager) -> Result<CachedOp> {
        self.cached_op_builder(manager).build()
    }

    pub fn into_parts(self) -> (Symbol, ParameterSet) {
        (self.symbol, self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shape;

    #[test]
    fn duplicate_names_rejected() {
        let m = NdManager::cpu();
        let mut params = ParameterSet::new();
        params.insert("w", m.zeros(&Shape::new(vec![1])).unwrap()).unwrap();
        let err = params.insert("w", m.zeros(&Shape::new(vec![1])).unwrap());
        assert!(matches!(err, Err(MxError::InvalidArgument(_))));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn insertion_order_preserved() {
        let m = NdManager::cpu();
        let mut params = ParameterSet::new();
        for name in ["b", "a", "c"] {
            params.insert(name, m.zeros(&Shape::new(vec![1])).unwrap()).unwrap();
        }
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert!(params.remove("a").is_some());
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
