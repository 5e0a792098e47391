//! The mined grammar: nonterminals mapped to ordered sets of
//! alternatives, serialized in the angle-bracket/quoted-literal JSON
//! convention.

use crate::error::{Error, Result};
use petgraph::{visit::Bfs, Graph};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// One symbol on a right-hand side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sym {
    /// A literal byte string.
    Term(Vec<u8>),
    /// A reference to a nonterminal, bracket-less name.
    Ref(String),
}

impl Sym {
    pub fn is_term(&self) -> bool {
        matches!(self, Sym::Term(_))
    }
}

/// Byte strings must survive JSON: every byte maps to the char with the
/// same scalar value, so arbitrary seeds round-trip.
pub fn literal_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn string_to_literal(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u8).collect()
}

/// One alternative: a symbol sequence plus whether it came from a
/// truncated or partially-consumed trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternative {
    pub syms: Vec<Sym>,
    pub partial: bool,
}

impl Alternative {
    pub fn new(syms: Vec<Sym>) -> Self {
        Alternative {
            syms,
            partial: false,
        }
    }

    pub fn is_epsilon(&self) -> bool {
        self.syms.is_empty()
    }
}

impl fmt::Display for Alternative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.syms.is_empty() {
            return f.write_str("ε");
        }
        for (i, sym) in self.syms.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match sym {
                Sym::Term(bytes) => write!(f, "'{}'", literal_to_string(bytes))?,
                Sym::Ref(name) => write!(f, "<{}>", name)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Rule {
    alts: Vec<Alternative>,
    /// Byte-identity dedup over `alts`.
    seen: HashSet<Vec<Sym>>,
}

/// Mapping from nonterminal name (bracket-less) to its alternatives,
/// preserving insertion order of both keys and alternatives so that two
/// identical runs serialize byte-identically.
#[derive(Debug, Clone)]
pub struct Grammar {
    start: String,
    order: Vec<String>,
    rules: HashMap<String, Rule>,
}

impl Grammar {
    pub fn new(start: impl Into<String>) -> Self {
        Grammar {
            start: start.into(),
            order: Vec::new(),
            rules: HashMap::new(),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn nonterminals(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn alternatives(&self, nonterminal: &str) -> Option<&[Alternative]> {
        self.rules.get(nonterminal).map(|r| r.alts.as_slice())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert an alternative, deduplicating under byte identity. A
    /// duplicate arriving without the partial flag clears the flag on
    /// the stored alternative (a full trace vouches for it).
    pub fn add_alternative(&mut self, nonterminal: &str, alt: Alternative) {
        let rule = match self.rules.entry(nonterminal.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                self.order.push(nonterminal.to_string());
                e.insert(Rule::default())
            }
        };

        if rule.seen.contains(&alt.syms) {
            if !alt.partial {
                if let Some(existing) = rule.alts.iter_mut().find(|a| a.syms == alt.syms) {
                    existing.partial = false;
                }
            }
            return;
        }
        rule.seen.insert(alt.syms.clone());
        rule.alts.push(alt);
    }

    /// Set union of alternatives, preserving `self`'s insertion order
    /// first. The miner folds each tree's grammar into the aggregate
    /// with this; merging is idempotent and associative over
    /// alternative sets.
    pub fn merge(&mut self, other: Grammar) {
        for name in other.order {
            let rule = &other.rules[&name];
            for alt in &rule.alts {
                self.add_alternative(&name, alt.clone());
            }
        }
    }

    /// Drop every nonterminal not reachable from the start symbol.
    pub fn prune_unreachable(&mut self) {
        let mut graph = Graph::<&str, ()>::new();
        let mut nodes = HashMap::new();

        for name in &self.order {
            let src = *nodes
                .entry(name.as_str())
                .or_insert_with(|| graph.add_node(name.as_str()));
            for alt in &self.rules[name].alts {
                for sym in &alt.syms {
                    if let Sym::Ref(target) = sym {
                        let dst = *nodes
                            .entry(target.as_str())
                            .or_insert_with(|| graph.add_node(target.as_str()));
                        graph.add_edge(src, dst, ());
                    }
                }
            }
        }

        let Some(&entry) = nodes.get(self.start.as_str()) else {
            // start never seen: nothing is reachable
            self.order.clear();
            self.rules.clear();
            return;
        };

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&graph, entry);
        while let Some(idx) = bfs.next(&graph) {
            reachable.insert(graph[idx].to_string());
        }

        self.order.retain(|name| reachable.contains(name));
        self.rules.retain(|name, _| reachable.contains(name));
    }

    /// Every referenced nonterminal must be a key; the start must be
    /// present. Violations are miner bugs.
    pub fn check_closure(&self) -> Result<()> {
        if !self.rules.contains_key(&self.start) {
            return Err(Error::GrammarReferenceMissing(format!("<{}>", self.start)));
        }
        for name in &self.order {
            for alt in &self.rules[name].alts {
                for sym in &alt.syms {
                    if let Sym::Ref(target) = sym {
                        if !self.rules.contains_key(target) {
                            return Err(Error::GrammarReferenceMissing(format!(
                                "<{}>",
                                target
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize and atomically replace `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// `{"[start]": "<s>", "[grammar]": {"<s>": [["'lit'", "<ref>"], ...]},
/// "[partial]": [["<s>", 0], ...]}`, keys and alternatives in insertion
/// order, references angle-bracketed, literals single-quoted.
impl Serialize for Grammar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        struct RulesMap<'a>(&'a Grammar);
        struct Alts<'a>(&'a [Alternative]);
        struct AltSyms<'a>(&'a Alternative);

        impl Serialize for RulesMap<'_> {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.order.len()))?;
                for name in &self.0.order {
                    map.serialize_entry(
                        &format!("<{}>", name),
                        &Alts(&self.0.rules[name].alts),
                    )?;
                }
                map.end()
            }
        }

        impl Serialize for Alts<'_> {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for alt in self.0 {
                    seq.serialize_element(&AltSyms(alt))?;
                }
                seq.end()
            }
        }

        impl Serialize for AltSyms<'_> {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.syms.len()))?;
                for sym in &self.0.syms {
                    match sym {
                        Sym::Term(bytes) => seq
                            .serialize_element(&format!("'{}'", literal_to_string(bytes)))?,
                        Sym::Ref(name) => seq.serialize_element(&format!("<{}>", name))?,
                    }
                }
                seq.end()
            }
        }

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("[start]", &format!("<{}>", self.start))?;
        map.serialize_entry("[grammar]", &RulesMap(self))?;

        let partial: Vec<(String, usize)> = self
            .order
            .iter()
            .flat_map(|name| {
                self.rules[name]
                    .alts
                    .iter()
                    .enumerate()
                    .filter(|(_, alt)| alt.partial)
                    .map(move |(i, _)| (format!("<{}>", name), i))
            })
            .collect();
        map.serialize_entry("[partial]", &partial)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(s: &str) -> Sym {
        Sym::Term(s.as_bytes().to_vec())
    }

    fn rref(s: &str) -> Sym {
        Sym::Ref(s.to_string())
    }

    #[test]
    fn dedup_is_byte_identity() {
        let mut g = Grammar::new("parse_expr");
        g.add_alternative("parse_expr", Alternative::new(vec![term("1")]));
        g.add_alternative("parse_expr", Alternative::new(vec![term("1")]));
        g.add_alternative("parse_expr", Alternative::new(vec![term("2")]));
        assert_eq!(g.alternatives("parse_expr").unwrap().len(), 2);
    }

    #[test]
    fn full_trace_clears_partial_flag() {
        let mut g = Grammar::new("s");
        g.add_alternative(
            "s",
            Alternative {
                syms: vec![term("x")],
                partial: true,
            },
        );
        g.add_alternative("s", Alternative::new(vec![term("x")]));
        assert!(!g.alternatives("s").unwrap()[0].partial);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = Grammar::new("s");
        a.add_alternative("s", Alternative::new(vec![rref("num"), term("+"), rref("num")]));
        a.add_alternative("num", Alternative::new(vec![term("1")]));

        let mut b = Grammar::new("s");
        b.add_alternative("s", Alternative::new(vec![rref("num"), term("+"), rref("num")]));
        b.add_alternative("num", Alternative::new(vec![term("2")]));

        let mut union = a.clone();
        union.merge(b.clone());
        let mut twice = union.clone();
        twice.merge(b);

        let left = serde_json::to_string(&union).unwrap();
        let right = serde_json::to_string(&twice).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn unreachable_nonterminals_pruned() {
        let mut g = Grammar::new("s");
        g.add_alternative("s", Alternative::new(vec![rref("a")]));
        g.add_alternative("a", Alternative::new(vec![term("x")]));
        g.add_alternative("orphan", Alternative::new(vec![term("y")]));
        g.prune_unreachable();
        assert_eq!(g.nonterminals().collect::<Vec<_>>(), vec!["s", "a"]);
        g.check_closure().unwrap();
    }

    #[test]
    fn missing_reference_detected() {
        let mut g = Grammar::new("s");
        g.add_alternative("s", Alternative::new(vec![rref("ghost")]));
        assert!(matches!(
            g.check_closure(),
            Err(Error::GrammarReferenceMissing(_))
        ));
    }

    #[test]
    fn serialization_shape() {
        let mut g = Grammar::new("parse_expr");
        g.add_alternative(
            "parse_expr",
            Alternative::new(vec![rref("parse_num"), term("+"), rref("parse_num")]),
        );
        g.add_alternative("parse_num", Alternative::new(vec![term("1")]));
        g.add_alternative("parse_num", Alternative::new(vec![term("2")]));

        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&g).unwrap()).unwrap();
        assert_eq!(value["[start]"], "<parse_expr>");
        assert_eq!(
            value["[grammar]"]["<parse_expr>"][0],
            serde_json::json!(["<parse_num>", "'+'", "<parse_num>"])
        );
        assert_eq!(value["[grammar]"]["<parse_num>"][0][0], "'1'");
        assert_eq!(value["[partial]"], serde_json::json!([]));
    }

    #[test]
    fn non_utf8_literal_round_trips() {
        let bytes = vec![0x00, 0xff, 0x80, b'a'];
        let s = literal_to_string(&bytes);
        assert_eq!(string_to_literal(&s), bytes);
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parsing_g.json");
        let mut g = Grammar::new("s");
        g.add_alternative("s", Alternative::new(vec![term("x")]));
        g.write_atomic(&path).unwrap();
        g.add_alternative("s", Alternative::new(vec![term("y")]));
        g.write_atomic(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("'y'"));
        assert!(!dir.path().join("parsing_g.json.tmp").exists());
    }
}
