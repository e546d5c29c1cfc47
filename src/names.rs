//! Function-index-to-name mapping, built from the module's `"name"`
//! custom section with export names as a display fallback.


use std::collections::BTreeMap;

use crate::error::FormatError;
use crate::module::{ExportKind, Module, NameSubsection};

/// How strictly the function-names subsection is validated.
///
/// `Strict` insists that entries are keyed 0, 1, 2, … with no gaps, a
/// sanity check against corrupt tables. Real-world toolchains emit sparse
/// tables, which `Lenient` accepts keyed as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMap {
    names: BTreeMap<u32, String>,
}

impl NameMap {
    pub fn get(&self, index: u32) -> Option<&str> {
        self.names.get(&index).map(String::as_str)
    }

    pub fn insert(&mut self, index: u32, name: String) {
        self.names.insert(index, name);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Function index for a display name, if any entry carries it.
    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .find(|(_, candidate)| candidate.as_str() == name)
            .map(|(&index, _)| index)
    }

    /// Fills gaps with exported function names, so traces stay readable
    /// for modules without a name section.
    pub fn fill_from_exports(&mut self, module: &Module) {
        if let Some(exports) = module.export_section() {
            for export in exports {
                if export.kind == ExportKind::Func {
                    self.names
                        .entry(export.index)
                        .or_insert_with(|| export.name.clone());
                }
            }
        }
    }
}

/// Builds the function name map from the `"name"` custom section. Absent
/// section or subsection yields an empty map; tracing then falls back to
/// numeric indices.
pub fn function_names(module: &Module, policy: NamePolicy) -> Result<NameMap, FormatError> {
    let mut map = NameMap::default();
    let Some(names) = module.name_section() else {
        return Ok(map);
    };
    for subsection in &names.subsections {
        let NameSubsection::Functions(entries) = subsection else {
            continue;
        };
        for (position, (index, name)) in entries.iter().enumerate() {
            if policy == NamePolicy::Strict && *index != position as u32 {
                return Err(FormatError::MalformedNameSection {
                    reason: format!(
                        "function name entry {position} is keyed by index {index}"
                    ),
                });
            }
            map.insert(*index, name.clone());
        }
    }
    Ok(map)
}
