//! Parse-tree data model and the annotation passes that turn a raw
//! traced call tree into a well-formed parse tree.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One input file: the atomic evidence unit. Indices `0..len` are what
/// the tracer attributes to frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Seed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Seed { name, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Identity of "the same call in the grammar sense". Two activations
/// with equal keys feed the same nonterminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSiteKey {
    /// Sanitized function symbol.
    pub func: String,
    /// Caller's `file:line`, present only when call-site qualification
    /// is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_site: Option<String>,
}

impl CallSiteKey {
    pub fn new(func: impl Into<String>) -> Self {
        CallSiteKey {
            func: sanitize_symbol(&func.into()),
            call_site: None,
        }
    }

    pub fn qualified(func: impl Into<String>, call_site: impl Into<String>) -> Self {
        CallSiteKey {
            func: sanitize_symbol(&func.into()),
            call_site: Some(call_site.into()),
        }
    }

    /// The grammar-side name, bracket-less.
    pub fn name(&self) -> String {
        match &self.call_site {
            None => self.func.clone(),
            Some(site) => format!("{}@{}", self.func, site),
        }
    }

    /// The grammar-side name, angle brackets included.
    pub fn nonterminal(&self) -> String {
        format!("<{}>", self.name())
    }
}

impl fmt::Display for CallSiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nonterminal())
    }
}

/// Demangled C++ symbols carry characters that collide with the grammar
/// serialization; flatten them the way the reference tracer does.
pub fn sanitize_symbol(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '<' | '>' | ':' | ' ' | ',' | '#' | '.' => '_',
            c => c,
        })
        .collect()
}

/// Runtime identity of one activation during a single trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameId {
    pub key: CallSiteKey,
    /// Stack depth relative to the entry frame (entry = 0).
    pub depth: usize,
    /// Monotonically increasing activation counter within the trace.
    pub serial: u64,
}

/// A literal run of input bytes owned by a node (not covered by any
/// child). Half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub lo: usize,
    pub hi: usize,
}

/// One node of the parse tree: an activation plus the input range it
/// consumed, directly or through its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseNode {
    pub frame: FrameId,
    /// Half-open consumed range; `lo == hi` for an epsilon node.
    pub lo: usize,
    pub hi: usize,
    /// Indices this frame read itself, in attribution order.
    pub reads: Vec<usize>,
    pub children: Vec<ParseNode>,
    /// Filled by the annotator: sub-ranges of `[lo, hi)` not covered by
    /// any child, in left-to-right order.
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl ParseNode {
    pub fn is_empty_range(&self) -> bool {
        self.lo == self.hi
    }

    /// Terminal yield in left-to-right order; equals the consumed slice
    /// of the seed for a well-formed tree.
    pub fn yield_bytes(&self, seed: &[u8], out: &mut Vec<u8>) {
        let mut child = self.children.iter().peekable();
        let mut span = self.spans.iter().peekable();
        // spans and children are disjoint and ordered, so a two-finger
        // walk by lo reconstructs the surface order
        loop {
            match (child.peek(), span.peek()) {
                (Some(c), Some(s)) => {
                    if s.lo < c.lo {
                        let s = span.next().unwrap();
                        out.extend_from_slice(&seed[s.lo..s.hi]);
                    } else {
                        child.next().unwrap().yield_bytes(seed, out);
                    }
                }
                (Some(_), None) => child.next().unwrap().yield_bytes(seed, out),
                (None, Some(_)) => {
                    let s = span.next().unwrap();
                    out.extend_from_slice(&seed[s.lo..s.hi]);
                }
                (None, None) => break,
            }
        }
    }
}

/// The per-seed artifact: an annotated root plus how the trace ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub seed_name: String,
    pub input_len: usize,
    pub root: ParseNode,
    /// The trace ended early (crash, signal, timeout).
    #[serde(default)]
    pub truncated: bool,
    /// The parser returned without consuming every input byte.
    #[serde(default)]
    pub partially_consumed: bool,
}

impl Trace {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(file, self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(file).map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

/// Turns raw traced trees into well-formed parse trees: collapses
/// ignored frames, closes ranges, checks sibling disjointness, fills
/// gaps with owned spans and settles unread head/tail bytes.
pub struct Annotator<'a> {
    ignore: Option<&'a Regex>,
}

impl<'a> Annotator<'a> {
    pub fn new(ignore: Option<&'a Regex>) -> Self {
        Annotator { ignore }
    }

    pub fn annotate(&self, mut trace: Trace) -> Result<Trace> {
        let seed_name = trace.seed_name.clone();
        self.collapse_ignored(&mut trace.root);
        close_ranges(&mut trace.root);
        check_nesting(&trace.root, &seed_name)?;

        // Unconsumed head or tail bytes become literal runs on the root.
        let n = trace.input_len;
        if trace.root.lo > 0 || trace.root.hi < n {
            trace.partially_consumed = true;
            trace.root.lo = 0;
            trace.root.hi = n;
        }
        if n == 0 {
            trace.root.lo = 0;
            trace.root.hi = 0;
        }

        fill_gaps(&mut trace.root);
        Ok(trace)
    }

    /// Remove nodes whose symbol matches the ignore predicate, splicing
    /// their children into the parent at their position. Their direct
    /// reads surface later as the parent's owned spans.
    fn collapse_ignored(&self, node: &mut ParseNode) {
        let Some(re) = self.ignore else {
            for child in &mut node.children {
                self.collapse_ignored(child);
            }
            return;
        };

        let mut rebuilt = Vec::with_capacity(node.children.len());
        for mut child in node.children.drain(..) {
            self.collapse_ignored(&mut child);
            if re.is_match(&child.frame.key.func) {
                node.reads.extend_from_slice(&child.reads);
                rebuilt.extend(child.children);
            } else {
                rebuilt.push(child);
            }
        }
        node.children = rebuilt;
    }
}

/// Bottom-up: a node's range is the hull of its own reads and its
/// children's ranges.
fn close_ranges(node: &mut ParseNode) {
    for child in &mut node.children {
        close_ranges(child);
    }

    let mut lo = usize::MAX;
    let mut hi = 0usize;
    for &i in &node.reads {
        lo = lo.min(i);
        hi = hi.max(i + 1);
    }
    for child in &node.children {
        if !child.is_empty_range() {
            lo = lo.min(child.lo);
            hi = hi.max(child.hi);
        }
    }

    if lo == usize::MAX {
        // Nothing consumed anywhere below: epsilon node. Anchor it so
        // siblings stay ordered.
        let anchor = node.lo.min(node.hi);
        node.lo = anchor;
        node.hi = anchor;
    } else {
        node.lo = lo;
        node.hi = hi;
    }
}

/// Sibling ranges must be pairwise disjoint and strictly increasing;
/// anything else is a watchpoint-timing artifact.
fn check_nesting(node: &ParseNode, seed_name: &str) -> Result<()> {
    let mut cursor = node.lo;
    for child in &node.children {
        if child.is_empty_range() {
            continue;
        }
        if child.lo < cursor || child.hi > node.hi {
            return Err(Error::InconsistentTree(
                seed_name.to_string(),
                format!(
                    "child {} [{}, {}) overlaps a sibling or escapes parent [{}, {})",
                    child.frame.key, child.lo, child.hi, node.lo, node.hi
                ),
            ));
        }
        cursor = child.hi;
    }
    for child in &node.children {
        check_nesting(child, seed_name)?;
    }
    Ok(())
}

/// Any sub-range of `[lo, hi)` not covered by a child becomes an owned
/// span, emitted later as a literal terminal.
fn fill_gaps(node: &mut ParseNode) {
    node.spans.clear();
    let mut cursor = node.lo;
    for child in &mut node.children {
        if !child.is_empty_range() {
            if cursor < child.lo {
                node.spans.push(Span {
                    lo: cursor,
                    hi: child.lo,
                });
            }
            cursor = child.hi;
        }
        fill_gaps(child);
    }
    if cursor < node.hi {
        node.spans.push(Span {
            lo: cursor,
            hi: node.hi,
        });
    }
}
