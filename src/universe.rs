// =============================================================================
// Symbol Universe — active symbols, index membership, tier classification
// =============================================================================
//
// Loaded once at startup from the reference files under `<data_dir>/reference`
// and read-only afterwards. Universe order is preserved: the backfill pool
// walks symbols in exactly this order.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::types::Tier;

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub symbol: String,
    /// Member of a tracked index constituent list.
    pub is_index: bool,
}

pub struct SymbolUniverse {
    entries: Vec<SymbolEntry>,
    index_members: HashSet<String>,
    tiers: HashMap<String, Tier>,
}

/// `reference/index_members.json`: constituent list name → symbols.
#[derive(Deserialize)]
struct IndexMembersFile(HashMap<String, Vec<String>>);

impl SymbolUniverse {
    /// Load the universe from the reference files. The symbol list and the
    /// index constituent lists are required (startup fatal when missing);
    /// the tier classification is optional and defaults to empty.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let reference = data_dir.join("reference");

        let universe_path = reference.join("universe.json");
        let content = std::fs::read_to_string(&universe_path).with_context(|| {
            format!("failed to read symbol universe from {}", universe_path.display())
        })?;
        let symbols: Vec<String> = serde_json::from_str(&content).with_context(|| {
            format!("failed to parse symbol universe from {}", universe_path.display())
        })?;

        let members_path = reference.join("index_members.json");
        let content = std::fs::read_to_string(&members_path).with_context(|| {
            format!("failed to read index members from {}", members_path.display())
        })?;
        let members: IndexMembersFile = serde_json::from_str(&content).with_context(|| {
            format!("failed to parse index members from {}", members_path.display())
        })?;
        let index_members: HashSet<String> = members.0.into_values().flatten().collect();

        let tiers_path = reference.join("tiers.json");
        let tiers: HashMap<String, Tier> = match std::fs::read_to_string(&tiers_path) {
            Ok(content) => serde_json::from_str(&content).with_context(|| {
                format!("failed to parse tier classification from {}", tiers_path.display())
            })?,
            Err(e) => {
                warn!(
                    path = %tiers_path.display(),
                    error = %e,
                    "tier classification unavailable; movers selection will be empty"
                );
                HashMap::new()
            }
        };

        let universe = Self::from_parts(symbols, index_members, tiers);
        info!(
            symbols = universe.entries.len(),
            index = universe.index_members.len(),
            tiers = universe.tiers.len(),
            "symbol universe loaded"
        );
        Ok(universe)
    }

    pub fn from_parts(
        symbols: Vec<String>,
        index_members: HashSet<String>,
        tiers: HashMap<String, Tier>,
    ) -> Self {
        let entries = symbols
            .into_iter()
            .map(|symbol| {
                let is_index = index_members.contains(&symbol);
                SymbolEntry { symbol, is_index }
            })
            .collect();
        Self {
            entries,
            index_members,
            tiers,
        }
    }

    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_index(&self, symbol: &str) -> bool {
        self.index_members.contains(symbol)
    }

    pub fn tiers(&self) -> &HashMap<String, Tier> {
        &self.tiers
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classification_follows_constituent_lists() {
        let universe = SymbolUniverse::from_parts(
            vec!["AAPL".into(), "GME".into(), "MSFT".into()],
            ["AAPL".to_string(), "MSFT".to_string()].into(),
            HashMap::new(),
        );

        assert_eq!(universe.len(), 3);
        assert!(universe.is_index("AAPL"));
        assert!(!universe.is_index("GME"));
        let flags: Vec<bool> = universe.entries().iter().map(|e| e.is_index).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn universe_order_is_preserved() {
        let universe = SymbolUniverse::from_parts(
            vec!["Z".into(), "A".into(), "M".into()],
            HashSet::new(),
            HashMap::new(),
        );
        let order: Vec<&str> = universe.entries().iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(order, vec!["Z", "A", "M"]);
    }

    #[test]
    fn load_reads_reference_files() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("reference");
        std::fs::create_dir_all(&reference).unwrap();

        let mut f = std::fs::File::create(reference.join("universe.json")).unwrap();
        write!(f, r#"["AAPL", "GME"]"#).unwrap();
        let mut f = std::fs::File::create(reference.join("index_members.json")).unwrap();
        write!(f, r#"{{"SPX": ["AAPL"], "NDX": ["AAPL"]}}"#).unwrap();
        let mut f = std::fs::File::create(reference.join("tiers.json")).unwrap();
        write!(f, r#"{{"AAPL": "ACTIVE", "GME": "MODERATE"}}"#).unwrap();

        let universe = SymbolUniverse::load(dir.path()).unwrap();
        assert_eq!(universe.len(), 2);
        assert!(universe.is_index("AAPL"));
        assert_eq!(universe.tiers()[&"GME".to_string()], Tier::Moderate);
    }

    #[test]
    fn load_fails_without_universe_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SymbolUniverse::load(dir.path()).is_err());
    }
}
