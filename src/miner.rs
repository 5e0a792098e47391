//! Grammar induction: folds annotated parse trees into a single grammar
//! by nonterminal fusion and alternative collection.

use crate::error::Result;
use crate::grammar::{Alternative, Grammar, Sym};
use crate::tree::{ParseNode, Trace};
use tracing::{debug, info};

pub struct Miner {
    grammar: Grammar,
    trees: usize,
}

impl Miner {
    /// `start` is the entrypoint's nonterminal, bracket-less.
    pub fn new(start: impl Into<String>) -> Self {
        Miner {
            grammar: Grammar::new(start),
            trees: 0,
        }
    }

    /// Ingest one annotated tree: collect its alternatives pre-order
    /// into a per-tree grammar, then fold that into the aggregate by
    /// set union. Seeds must be fed in their lexical file order, which
    /// together with the pre-order walk fixes the grammar's insertion
    /// order.
    pub fn ingest(&mut self, trace: &Trace, seed: &[u8]) {
        self.trees += 1;
        let mut tree_grammar = Grammar::new(self.grammar.start());
        let mark_all = trace.truncated;
        Self::walk(
            &mut tree_grammar,
            &trace.root,
            seed,
            true,
            trace.partially_consumed,
            mark_all,
        );
        self.grammar.merge(tree_grammar);
    }

    fn walk(
        grammar: &mut Grammar,
        node: &ParseNode,
        seed: &[u8],
        is_root: bool,
        root_partial: bool,
        mark_all: bool,
    ) {
        let mut alt = extract_alternative(node, seed);
        alt.partial = mark_all || (is_root && root_partial);
        let name = node.frame.key.name();
        debug!(nonterminal = %name, alternative = %alt, "collect");
        grammar.add_alternative(&name, alt);

        for child in &node.children {
            Self::walk(grammar, child, seed, false, root_partial, mark_all);
        }
    }

    /// Prune unreachable nonterminals and validate closure.
    pub fn finish(mut self) -> Result<Grammar> {
        self.grammar.prune_unreachable();
        self.grammar.check_closure()?;
        info!(
            trees = self.trees,
            nonterminals = self.grammar.len(),
            "grammar induced"
        );
        Ok(self.grammar)
    }
}

/// The left-to-right interleaving of owned spans (literals) and child
/// references, adjacent literals coalesced. An epsilon node yields the
/// empty alternative.
fn extract_alternative(node: &ParseNode, seed: &[u8]) -> Alternative {
    let mut syms: Vec<Sym> = Vec::new();
    let mut push_term = |syms: &mut Vec<Sym>, lo: usize, hi: usize| {
        let bytes = &seed[lo..hi];
        if let Some(Sym::Term(prev)) = syms.last_mut() {
            prev.extend_from_slice(bytes);
        } else {
            syms.push(Sym::Term(bytes.to_vec()));
        }
    };

    let mut child = node.children.iter().peekable();
    let mut span = node.spans.iter().peekable();
    loop {
        match (child.peek(), span.peek()) {
            (Some(c), Some(s)) => {
                // on a tie the child comes first: an epsilon frame ran
                // before the bytes at its anchor were read
                if s.lo < c.lo {
                    let s = span.next().unwrap();
                    push_term(&mut syms, s.lo, s.hi);
                } else {
                    let c = child.next().unwrap();
                    syms.push(Sym::Ref(nonterminal_name(c)));
                }
            }
            (Some(_), None) => {
                let c = child.next().unwrap();
                syms.push(Sym::Ref(nonterminal_name(c)));
            }
            (None, Some(_)) => {
                let s = span.next().unwrap();
                push_term(&mut syms, s.lo, s.hi);
            }
            (None, None) => break,
        }
    }

    Alternative::new(syms)
}

fn nonterminal_name(node: &ParseNode) -> String {
    node.frame.key.name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::node;
    use crate::tree::{Annotator, Trace};

    fn annotated(root: ParseNode, seed: &[u8]) -> Trace {
        Annotator::new(None)
            .annotate(Trace {
                seed_name: "seed-0".into(),
                input_len: seed.len(),
                root,
                truncated: false,
                partially_consumed: false,
            })
            .unwrap()
    }

    fn mine(traces: &[(Trace, &[u8])], start: &str) -> Grammar {
        let mut miner = Miner::new(start);
        for (trace, seed) in traces {
            miner.ingest(trace, seed);
        }
        miner.finish().unwrap()
    }

    /// Arithmetic calculator over "1+2": the sum-level nonterminal must
    /// hold `num "+" num`, and the number-level one both digits.
    #[test]
    fn calculator_scenario() {
        let seed: &[u8] = b"1+2";
        let root = node(
            "parse_sum",
            0,
            0,
            vec![1],
            vec![
                node("parse_num", 1, 1, vec![0], vec![]),
                node("parse_num", 2, 1, vec![2], vec![]),
            ],
        );
        let trace = annotated(root, seed);
        let g = mine(&[(trace, seed)], "parse_sum");

        let sum = g.alternatives("parse_sum").unwrap();
        assert_eq!(sum.len(), 1);
        assert_eq!(
            sum[0].syms,
            vec![
                Sym::Ref("parse_num".into()),
                Sym::Term(b"+".to_vec()),
                Sym::Ref("parse_num".into()),
            ]
        );

        let num = g.alternatives("parse_num").unwrap();
        let derived: Vec<_> = num.iter().map(|a| a.syms.clone()).collect();
        assert!(derived.contains(&vec![Sym::Term(b"1".to_vec())]));
        assert!(derived.contains(&vec![Sym::Term(b"2".to_vec())]));
    }

    /// CGI decoder over "a+b%20c": one alternative per token shape.
    #[test]
    fn cgi_decode_scenario() {
        let seed: &[u8] = b"a+b%20c";
        let root = node(
            "cgi_decode",
            0,
            0,
            vec![],
            vec![
                node("decode_char", 1, 1, vec![0], vec![]),
                node("decode_plus", 2, 1, vec![1], vec![]),
                node("decode_char", 3, 1, vec![2], vec![]),
                node("decode_escape", 4, 1, vec![3, 4, 5], vec![]),
                node("decode_char", 5, 1, vec![6], vec![]),
            ],
        );
        let trace = annotated(root, seed);

        let mut yielded = Vec::new();
        trace.root.yield_bytes(seed, &mut yielded);
        assert_eq!(yielded, seed);

        let g = mine(&[(trace, seed)], "cgi_decode");
        let escape = g.alternatives("decode_escape").unwrap();
        assert_eq!(escape[0].syms, vec![Sym::Term(b"%20".to_vec())]);
        let plus = g.alternatives("decode_plus").unwrap();
        assert_eq!(plus[0].syms, vec![Sym::Term(b"+".to_vec())]);
    }

    /// JSON list over "[1,2]": brackets and comma are the list's owned
    /// spans, elements are references.
    #[test]
    fn json_list_scenario() {
        let seed: &[u8] = b"[1,2]";
        let root = node(
            "parse_list",
            0,
            0,
            vec![0, 2, 4],
            vec![
                node("parse_value", 1, 1, vec![1], vec![]),
                node("parse_value", 2, 1, vec![3], vec![]),
            ],
        );
        let trace = annotated(root, seed);
        let g = mine(&[(trace.clone(), seed)], "parse_list");

        let list = g.alternatives("parse_list").unwrap();
        assert_eq!(
            list[0].syms,
            vec![
                Sym::Term(b"[".to_vec()),
                Sym::Ref("parse_value".into()),
                Sym::Term(b",".to_vec()),
                Sym::Ref("parse_value".into()),
                Sym::Term(b"]".to_vec()),
            ]
        );

        // expanding the grammar along the tree reproduces the seed
        let mut expansion = Vec::new();
        expand_along(&trace.root, seed, &g, &mut expansion);
        assert_eq!(expansion, seed);
    }

    /// Replays the derivation recorded in the tree, checking each
    /// node's alternative is actually present in the grammar.
    fn expand_along(n: &ParseNode, seed: &[u8], g: &Grammar, out: &mut Vec<u8>) {
        let name = super::nonterminal_name(n);
        let alt = super::extract_alternative(n, seed);
        let alts = g.alternatives(&name).unwrap();
        assert!(alts.iter().any(|a| a.syms == alt.syms));

        let mut children = n.children.iter();
        for sym in &alt.syms {
            match sym {
                Sym::Term(bytes) => out.extend_from_slice(bytes),
                Sym::Ref(_) => expand_along(children.next().unwrap(), seed, g, out),
            }
        }
    }

    /// Unread tail: the trailing bytes surface as a literal on the root
    /// and the root's alternative is marked partial; a run without that
    /// seed carries no such literal.
    #[test]
    fn unread_tail_scenario() {
        let seed: &[u8] = b"1;garbage";
        let root = node(
            "parse_stmt",
            0,
            0,
            vec![1],
            vec![node("parse_num", 1, 1, vec![0], vec![])],
        );
        let trace = annotated(root, seed);
        assert!(trace.partially_consumed);

        let g = mine(&[(trace, seed)], "parse_stmt");
        let stmt = g.alternatives("parse_stmt").unwrap();
        assert!(stmt[0].partial);
        assert_eq!(
            stmt[0].syms,
            vec![Sym::Ref("parse_num".into()), Sym::Term(b";garbage".to_vec())]
        );

        // rerun without the tail seed: no ";garbage" literal anywhere
        let clean = node(
            "parse_stmt",
            0,
            0,
            vec![1],
            vec![node("parse_num", 1, 1, vec![0], vec![])],
        );
        let clean = annotated(clean, b"1;");
        let g = mine(&[(clean, b"1;")], "parse_stmt");
        for name in g.nonterminals().collect::<Vec<_>>() {
            for alt in g.alternatives(name).unwrap() {
                for sym in &alt.syms {
                    if let Sym::Term(bytes) = sym {
                        assert!(!bytes.windows(8).any(|w| w == b";garbage"));
                    }
                }
            }
        }
    }

    /// Self-closing XML tag: the start nonterminal derives the bracket
    /// literals around the name reference.
    #[test]
    fn xml_tag_scenario() {
        let seed: &[u8] = b"<a/>";
        let root = node(
            "parse_tag",
            0,
            0,
            vec![0, 2, 3],
            vec![node("parse_name", 1, 1, vec![1], vec![])],
        );
        let trace = annotated(root, seed);
        let g = mine(&[(trace.clone(), seed)], "parse_tag");

        let tag = g.alternatives("parse_tag").unwrap();
        assert_eq!(
            tag[0].syms,
            vec![
                Sym::Term(b"<".to_vec()),
                Sym::Ref("parse_name".into()),
                Sym::Term(b"/>".to_vec()),
            ]
        );
        assert_eq!(
            g.alternatives("parse_name").unwrap()[0].syms,
            vec![Sym::Term(b"a".to_vec())]
        );

        // one derivation of the mined grammar re-parses the input
        let mut expansion = Vec::new();
        expand_along(&trace.root, seed, &g, &mut expansion);
        assert_eq!(expansion, seed);
    }

    /// Epsilon: a frame that consumed nothing contributes ε.
    #[test]
    fn epsilon_alternative() {
        let seed: &[u8] = b"x";
        let root = node(
            "parse",
            0,
            0,
            vec![0],
            vec![node("parse_ws", 1, 1, vec![], vec![])],
        );
        let trace = annotated(root, seed);
        let g = mine(&[(trace, seed)], "parse");
        let ws = g.alternatives("parse_ws").unwrap();
        assert!(ws[0].is_epsilon());
    }

    /// Determinism: ingesting the same trees twice in the same order
    /// serializes identically (and merging is a no-op).
    #[test]
    fn deterministic_output() {
        let seed: &[u8] = b"1+2";
        let build = || {
            let root = node(
                "parse_sum",
                0,
                0,
                vec![1],
                vec![
                    node("parse_num", 1, 1, vec![0], vec![]),
                    node("parse_num", 2, 1, vec![2], vec![]),
                ],
            );
            let trace = annotated(root, seed);
            mine(&[(trace, seed)], "parse_sum")
        };
        let a = serde_json::to_string(&build()).unwrap();
        let b = serde_json::to_string(&build()).unwrap();
        assert_eq!(a, b);
    }
}
