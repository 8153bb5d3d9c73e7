//! Symbolic dimension registry used during input processing.
//!
//! Each dynamic input dimension gets a stable [`DimSymbol`]. Named markers
//! are shared across inputs (the consistency obligation moves to execution
//! time); unnamed markers get generated names. Once the graph scope opens the
//! walk binds every registered symbol into the binding table so later calls
//! can consume it as a plain value.

use std::collections::BTreeMap;

use crate::graph::DimSymbol;

/// Where a symbol was first established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSource {
    pub input_index: usize,
    pub dim_index: usize,
}

#[derive(Default)]
pub(crate) struct SymbolicDims {
    by_name: BTreeMap<String, (DimSymbol, SymbolSource)>,
    counter: usize,
}

impl SymbolicDims {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the symbol for a dynamic dimension marker, registering the
    /// producing (input, dim) pair at first sight. A named marker seen again
    /// reuses its symbol and keeps the first source.
    pub(crate) fn intern(
        &mut self,
        marker: Option<&str>,
        input_index: usize,
        dim_index: usize,
    ) -> DimSymbol {
        let name = match marker {
            Some(name) => name.to_string(),
            None => {
                let generated = format!("s{}", self.counter);
                self.counter += 1;
                generated
            }
        };
        if let Some((symbol, _)) = self.by_name.get(&name) {
            return symbol.clone();
        }
        let symbol = DimSymbol::new(name.clone());
        self.by_name.insert(
            name,
            (
                symbol.clone(),
                SymbolSource {
                    input_index,
                    dim_index,
                },
            ),
        );
        symbol
    }

    /// Registered symbols in name order.
    pub(crate) fn symbols(&self) -> impl Iterator<Item = &DimSymbol> {
        self.by_name.values().map(|(symbol, _)| symbol)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }
}
