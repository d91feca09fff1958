//! Symbol relationship side index.
//!
//! Symbols and relations live in two flat arrays; relations reference
//! symbols by index, so there are no ownership cycles and the whole
//! structure serialises directly. Built from the import/export lists
//! the chunker recorded; the query pipeline uses it to pull in chunks
//! one hop away from a seed before selection.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::chunk::CodeChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Imports,
    Exports,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolNode {
    pub name: String,
}

/// One chunk↔symbol relation; `symbol` indexes into the node array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub symbol: usize,
    pub chunk_id: String,
    pub kind: RelationKind,
}

/// Flat-array symbol graph over one snapshot's chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolGraph {
    pub nodes: Vec<SymbolNode>,
    pub relations: Vec<Relation>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
}

impl SymbolGraph {
    /// Build from chunk relationship lists.
    pub fn build<'a>(chunks: impl IntoIterator<Item = &'a CodeChunk>) -> Self {
        let mut graph = SymbolGraph::default();
        for chunk in chunks {
            for name in &chunk.relationships.imports {
                let idx = graph.intern(name);
                graph.relations.push(Relation {
                    symbol: idx,
                    chunk_id: chunk.chunk_id.clone(),
                    kind: RelationKind::Imports,
                });
            }
            for name in &chunk.relationships.exports {
                let idx = graph.intern(name);
                graph.relations.push(Relation {
                    symbol: idx,
                    chunk_id: chunk.chunk_id.clone(),
                    kind: RelationKind::Exports,
                });
            }
        }
        graph
    }

    /// Rebuild the name lookup after deserialization.
    pub fn rebuild_lookup(&mut self) {
        self.by_name = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.by_name.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(SymbolNode {
            name: name.to_string(),
        });
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Chunk ids one relation hop from `chunk`: exporters of what it
    /// imports, importers of what it exports. Never includes the chunk
    /// itself; output is capped and deterministic.
    pub fn neighbors(&self, chunk: &CodeChunk, cap: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(&chunk.chunk_id);

        let wanted: Vec<(usize, RelationKind)> = chunk
            .relationships
            .imports
            .iter()
            .filter_map(|n| self.by_name.get(n).map(|&i| (i, RelationKind::Exports)))
            .chain(
                chunk
                    .relationships
                    .exports
                    .iter()
                    .filter_map(|n| self.by_name.get(n).map(|&i| (i, RelationKind::Imports))),
            )
            .collect();

        for relation in &self.relations {
            if out.len() >= cap {
                break;
            }
            if wanted
                .iter()
                .any(|(idx, kind)| relation.symbol == *idx && relation.kind == *kind)
                && seen.insert(&relation.chunk_id)
            {
                out.push(relation.chunk_id.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;

    fn chunk_with_relations(
        file: &str,
        start: u32,
        imports: &[&str],
        exports: &[&str],
    ) -> CodeChunk {
        let mut c = CodeChunk::new(file, start, start + 5, ChunkType::Block, format!("{file}:{start}"));
        c.relationships.imports = imports.iter().map(|s| s.to_string()).collect();
        c.relationships.exports = exports.iter().map(|s| s.to_string()).collect();
        c
    }

    #[test]
    fn test_build_interns_symbols_once() {
        let a = chunk_with_relations("a.rs", 1, &["serde"], &["parse"]);
        let b = chunk_with_relations("b.rs", 1, &["serde", "parse"], &[]);
        let graph = SymbolGraph::build([&a, &b]);

        assert_eq!(graph.nodes.len(), 2, "serde and parse");
        assert_eq!(graph.relations.len(), 4);
        for r in &graph.relations {
            assert!(r.symbol < graph.nodes.len(), "indices stay in bounds");
        }
    }

    #[test]
    fn test_neighbors_follow_import_to_exporter() {
        let exporter = chunk_with_relations("lib.rs", 1, &[], &["parse"]);
        let importer = chunk_with_relations("main.rs", 1, &["parse"], &[]);
        let graph = SymbolGraph::build([&exporter, &importer]);

        let n = graph.neighbors(&importer, 10);
        assert_eq!(n, vec![exporter.chunk_id.clone()]);

        // And the reverse: exporter sees its importers
        let n = graph.neighbors(&exporter, 10);
        assert_eq!(n, vec![importer.chunk_id.clone()]);
    }

    #[test]
    fn test_neighbors_never_include_self_and_respect_cap() {
        let hub = chunk_with_relations("hub.rs", 1, &[], &["util"]);
        let users: Vec<CodeChunk> = (0..5)
            .map(|i| chunk_with_relations("user.rs", i * 10 + 1, &["util"], &[]))
            .collect();
        let mut all = vec![hub.clone()];
        all.extend(users.clone());
        let graph = SymbolGraph::build(all.iter());

        let n = graph.neighbors(&hub, 3);
        assert_eq!(n.len(), 3, "capped");
        assert!(!n.contains(&hub.chunk_id));
    }

    #[test]
    fn test_serde_round_trip_with_lookup_rebuild() {
        let a = chunk_with_relations("a.rs", 1, &["x"], &["y"]);
        let graph = SymbolGraph::build([&a]);
        let json = serde_json::to_string(&graph).unwrap();
        let mut back: SymbolGraph = serde_json::from_str(&json).unwrap();
        back.rebuild_lookup();
        assert_eq!(back.nodes.len(), graph.nodes.len());
        assert_eq!(back.relations.len(), graph.relations.len());
        let n = back.neighbors(&a, 10);
        assert!(n.is_empty(), "self never returned");
    }
}
