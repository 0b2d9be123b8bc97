//! Structural chunk extraction via tree-sitter with a line-window fallback.
//!
//! Produces line-referenced candidates only: the extractor hands back
//! boundaries, hashes, a bounded preview and a mechanical outline, never a
//! code body.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use repomem_store::ChunkKind;
use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

use crate::fingerprint::{hash_text, truncate_chars};
use crate::languages::{Lang, detect_language};
use crate::splitter::split_lines;

/// Symbols listed in a file outline before the list is elided.
const MAX_OUTLINE_SYMBOLS: usize = 24;

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Target window size in characters for unstructured text.
    pub target_chars: usize,
    /// Trailing windows smaller than this merge into their predecessor.
    pub min_chars: usize,
    /// Hard window size, exceeded only by a single long line.
    pub max_chars: usize,
    /// Entities larger than this are replaced by their nested entities.
    pub max_symbol_chars: usize,
    /// Bound on the persisted preview of every chunk.
    pub preview_chars: usize,
    /// Files larger than this are skipped.
    pub max_file_bytes: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_chars: 1000,
            min_chars: 50,
            max_chars: 2000,
            max_symbol_chars: 6000,
            preview_chars: 300,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// One chunk-to-be, before enrichment and embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: ChunkKind,
    pub symbol_path: Option<String>,
    /// AST node kind, `"window"` or `"file"`.
    pub node_kind: String,
    pub line_range: Option<(usize, usize)>,
    pub preview: String,
    /// Mechanically derived summary.
    pub outline: String,
    pub content_hash: String,
    pub span_chars: usize,
    /// Entity definitions swallowed by this chunk.
    pub nested_symbols: usize,
}

impl Candidate {
    /// Source text this candidate refers to: its line range, or the whole
    /// file for a `file_index` candidate.
    #[must_use]
    pub fn span_text(&self, source: &str) -> String {
        match self.line_range {
            Some((start, end)) => source
                .lines()
                .skip(start.saturating_sub(1))
                .take(end + 1 - start.max(1))
                .collect::<Vec<_>>()
                .join("\n"),
            None => source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    NotUtf8,
    TooLarge { size: usize, max: usize },
    Unsupported,
    ParseFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty file"),
            Self::NotUtf8 => f.write_str("not valid UTF-8"),
            Self::TooLarge { size, max } => write!(f, "{size} bytes exceeds limit of {max}"),
            Self::Unsupported => f.write_str("unsupported file type"),
            Self::ParseFailed(e) => write!(f, "parse failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// `file_index` candidate first, then `symbol_index` candidates in line order.
    Chunks {
        language: Lang,
        candidates: Vec<Candidate>,
    },
    Skipped(SkipReason),
}

struct Span {
    name: String,
    node_kind: String,
    start_line: usize,
    end_line: usize,
    start_byte: usize,
    end_byte: usize,
    nested: usize,
}

struct ExtractCtx<'a> {
    source: &'a str,
    line_count: usize,
    lang: Lang,
    config: &'a ChunkerConfig,
}

/// Parse one file into candidate chunks.
///
/// Degenerate input is reported as [`Extracted::Skipped`], never as an error.
#[must_use]
pub fn extract(file_path: &str, bytes: &[u8], config: &ChunkerConfig) -> Extracted {
    let Some(lang) = detect_language(Path::new(file_path)) else {
        return Extracted::Skipped(SkipReason::Unsupported);
    };
    if lang != Lang::PlainText && lang.grammar().is_none() {
        return Extracted::Skipped(SkipReason::Unsupported);
    }
    if bytes.len() > config.max_file_bytes {
        return Extracted::Skipped(SkipReason::TooLarge {
            size: bytes.len(),
            max: config.max_file_bytes,
        });
    }
    let Ok(source) = std::str::from_utf8(bytes) else {
        return Extracted::Skipped(SkipReason::NotUtf8);
    };
    if source.trim().is_empty() {
        return Extracted::Skipped(SkipReason::Empty);
    }

    let ctx = ExtractCtx {
        source,
        line_count: source.lines().count(),
        lang,
        config,
    };

    let spans = if lang.is_structured() {
        match structural_spans(&ctx) {
            Ok(spans) => spans,
            Err(e) => return Extracted::Skipped(SkipReason::ParseFailed(e)),
        }
    } else {
        Vec::new()
    };

    let symbols = if spans.is_empty() {
        window_candidates(&ctx, file_path)
    } else {
        symbol_candidates(&ctx, file_path, spans)
    };

    let mut candidates = Vec::with_capacity(symbols.len() + 1);
    candidates.push(file_candidate(&ctx, file_path, &symbols));
    candidates.extend(symbols);

    Extracted::Chunks {
        language: lang,
        candidates,
    }
}

fn structural_spans(ctx: &ExtractCtx<'_>) -> Result<Vec<Span>, String> {
    let grammar = ctx
        .lang
        .grammar()
        .ok_or_else(|| format!("no grammar for {}", ctx.lang.id()))?;
    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .map_err(|e| format!("set_language failed: {e}"))?;
    let tree = parser
        .parse(ctx.source, None)
        .ok_or_else(|| "parser returned no tree".to_string())?;

    let root = tree.root_node();
    let mut spans = Vec::new();
    for child in named_children(&root) {
        if ctx.lang.entity_node_kinds().contains(&child.kind()) {
            collect_entity(ctx, child, "", &mut spans);
        }
    }

    spans.retain(|s| !ctx.source[s.start_byte..s.end_byte].trim().is_empty());
    spans.sort_by_key(|s| s.start_byte);
    Ok(merge_overlapping(spans))
}

fn collect_entity(ctx: &ExtractCtx<'_>, node: Node<'_>, scope: &str, out: &mut Vec<Span>) {
    let name = entity_name(&node, ctx.source, ctx.lang);
    let path = if scope.is_empty() {
        name
    } else {
        format!("{scope}.{name}")
    };

    let text = &ctx.source[node.byte_range()];
    let nested = nested_entities(&inner_definition(node), ctx.lang.entity_node_kinds());

    if text.chars().count() > ctx.config.max_symbol_chars && !nested.is_empty() {
        for inner in nested {
            collect_entity(ctx, inner, &path, out);
        }
        return;
    }

    out.push(Span {
        name: path,
        node_kind: inner_definition(node).kind().to_string(),
        start_line: node.start_position().row + 1,
        end_line: last_line(&node, ctx.line_count),
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
        nested: nested.len(),
    });
}

/// 1-based last line of `node`, clamped to the file.
///
/// Nodes that swallow their trailing newline (markdown sections) end at
/// column 0 of the following line, which belongs to the next sibling.
fn last_line(node: &Node<'_>, line_count: usize) -> usize {
    let start = node.start_position().row;
    let end = node.end_position();
    let line = if end.column == 0 && end.row > start {
        end.row
    } else {
        end.row + 1
    };
    line.min(line_count.max(start + 1))
}

/// Siblings sharing a line are folded together so line ranges stay disjoint.
fn merge_overlapping(spans: Vec<Span>) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(prev) if span.start_line <= prev.end_line => {
                prev.end_line = prev.end_line.max(span.end_line);
                prev.end_byte = prev.end_byte.max(span.end_byte);
                prev.nested += 1 + span.nested;
            }
            _ => merged.push(span),
        }
    }
    merged
}

fn named_children<'t>(node: &Node<'t>) -> Vec<Node<'t>> {
    let count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    (0..count).filter_map(|i| node.named_child(i)).collect()
}

/// Entity nodes below `node` that are not themselves inside another entity.
fn nested_entities<'t>(node: &Node<'t>, kinds: &[&str]) -> Vec<Node<'t>> {
    let mut found = Vec::new();
    for child in named_children(node) {
        if kinds.contains(&child.kind()) {
            found.push(child);
        } else {
            found.extend(nested_entities(&child, kinds));
        }
    }
    found
}

/// Unwrap decorator and export wrappers to the definition they carry.
fn inner_definition(node: Node<'_>) -> Node<'_> {
    node.child_by_field_name("definition")
        .or_else(|| node.child_by_field_name("declaration"))
        .unwrap_or(node)
}

fn entity_name(node: &Node<'_>, source: &str, lang: Lang) -> String {
    let text = |n: Node<'_>| {
        source[n.byte_range()]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };

    if lang == Lang::Markdown {
        let heading = source[node.byte_range()]
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().trim_start_matches('#').trim().to_string())
            .unwrap_or_default();
        return if heading.is_empty() {
            "section".to_string()
        } else {
            truncate_chars(&heading, 80).to_string()
        };
    }

    let def = inner_definition(*node);
    if def.kind() == "impl_item"
        && let (Some(tr), Some(ty)) = (
            def.child_by_field_name("trait"),
            def.child_by_field_name("type"),
        )
    {
        return format!("{} for {}", text(tr), text(ty));
    }
    if let Some(n) = def
        .child_by_field_name("name")
        .or_else(|| def.child_by_field_name("type"))
    {
        return text(n);
    }
    // `const x = ...`, `type Foo struct {}`: the name sits on the first declarator.
    if let Some(n) = named_children(&def)
        .into_iter()
        .find_map(|c| c.child_by_field_name("name"))
    {
        return text(n);
    }
    format!("{}@{}", def.kind(), node.start_position().row + 1)
}

fn kind_label(node_kind: &str) -> &str {
    match node_kind {
        "function_item" | "function_declaration" | "function_definition" => "Function",
        "method_definition" | "method_declaration" => "Method",
        "struct_item" => "Struct",
        "enum_item" => "Enum",
        "trait_item" => "Trait",
        "impl_item" => "Impl block",
        "type_item" | "type_alias_declaration" | "type_declaration" => "Type",
        "const_item" | "const_declaration" => "Constant",
        "static_item" => "Static",
        "mod_item" => "Module",
        "class_definition" | "class_declaration" => "Class",
        "interface_declaration" => "Interface",
        "macro_definition" => "Macro",
        "arrow_function" => "Arrow function",
        "lexical_declaration" => "Declaration",
        "section" => "Section",
        other => other,
    }
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn symbol_candidates(ctx: &ExtractCtx<'_>, file_path: &str, spans: Vec<Span>) -> Vec<Candidate> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    spans
        .into_iter()
        .map(|span| {
            let count = seen.entry(span.name.clone()).or_insert(0);
            *count += 1;
            let symbol_path = if *count == 1 {
                span.name
            } else {
                format!("{}#{count}", span.name)
            };

            let text = &ctx.source[span.start_byte..span.end_byte];
            let signature = truncate_chars(first_line(text), ctx.config.preview_chars).to_string();
            let mut outline = format!(
                "{} `{symbol_path}` in {file_path}: {signature}",
                kind_label(&span.node_kind)
            );
            if span.nested > 0 {
                outline.push_str(&format!(" ({} nested definitions)", span.nested));
            }

            Candidate {
                kind: ChunkKind::SymbolIndex,
                symbol_path: Some(symbol_path),
                node_kind: span.node_kind,
                line_range: Some((span.start_line, span.end_line)),
                preview: signature,
                outline,
                content_hash: hash_text(text),
                span_chars: text.chars().count(),
                nested_symbols: span.nested,
            }
        })
        .collect()
}

fn window_candidates(ctx: &ExtractCtx<'_>, file_path: &str) -> Vec<Candidate> {
    let lines: Vec<&str> = ctx.source.lines().collect();
    let cfg = ctx.config;
    split_lines(ctx.source, cfg.target_chars, cfg.min_chars, cfg.max_chars)
        .into_iter()
        .enumerate()
        .map(|(i, w)| {
            let n = i + 1;
            let text = lines[w.start_line - 1..w.end_line].join("\n");
            let lead = truncate_chars(first_line(&text), cfg.preview_chars);
            Candidate {
                kind: ChunkKind::SymbolIndex,
                symbol_path: Some(format!("window:{n}")),
                node_kind: "window".to_string(),
                line_range: Some((w.start_line, w.end_line)),
                preview: truncate_chars(text.trim_start(), cfg.preview_chars).to_string(),
                outline: format!("Part {n} of {file_path} ({}): {lead}", ctx.lang),
                content_hash: hash_text(&text),
                span_chars: text.chars().count(),
                nested_symbols: 0,
            }
        })
        .collect()
}

fn file_candidate(ctx: &ExtractCtx<'_>, file_path: &str, symbols: &[Candidate]) -> Candidate {
    let names: Vec<&str> = symbols
        .iter()
        .filter(|c| c.node_kind != "window")
        .filter_map(|c| c.symbol_path.as_deref())
        .collect();

    let outline = if names.is_empty() {
        format!(
            "File {file_path} ({}) split into {} parts",
            ctx.lang,
            symbols.len()
        )
    } else {
        let mut listed = names
            .iter()
            .take(MAX_OUTLINE_SYMBOLS)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        if names.len() > MAX_OUTLINE_SYMBOLS {
            listed.push_str(&format!(" and {} more", names.len() - MAX_OUTLINE_SYMBOLS));
        }
        format!(
            "File {file_path} ({}) defines {} symbols: {listed}",
            ctx.lang,
            names.len()
        )
    };

    let preview = truncate_chars(ctx.source.trim_start(), ctx.config.preview_chars).to_string();
    let identity = format!("{}\n{}\n{}\n{preview}", ctx.lang, symbols.len(), names.join("\n"));

    Candidate {
        kind: ChunkKind::FileIndex,
        symbol_path: None,
        node_kind: "file".to_string(),
        line_range: None,
        preview,
        outline,
        content_hash: hash_text(&identity),
        span_chars: ctx.source.chars().count(),
        nested_symbols: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkerConfig {
        ChunkerConfig::default()
    }

    fn chunks(path: &str, source: &str, config: &ChunkerConfig) -> Vec<Candidate> {
        match extract(path, source.as_bytes(), config) {
            Extracted::Chunks { candidates, .. } => candidates,
            Extracted::Skipped(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    fn symbols(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .filter_map(|c| c.symbol_path.as_deref())
            .collect()
    }

    const THREE_FUNCS: &str = r#"import os

def load(path):
    with open(path) as f:
        return f.read()

def bump_counter(counter):
    counter += 1
    return counter

def save(path, data):
    with open(path, "w") as f:
        f.write(data)
"#;

    #[test]
    fn python_functions_become_symbols() {
        let c = chunks("a.py", THREE_FUNCS, &config());
        assert_eq!(c.len(), 4);
        assert_eq!(c[0].kind, ChunkKind::FileIndex);
        assert_eq!(c[0].line_range, None);
        assert_eq!(symbols(&c), vec!["load", "bump_counter", "save"]);
        assert_eq!(c[1].line_range, Some((3, 5)));
        assert_eq!(c[2].line_range, Some((7, 9)));
        assert_eq!(c[3].line_range, Some((11, 13)));
        assert_eq!(c[2].preview, "def bump_counter(counter):");
        assert!(c[0].outline.contains("load, bump_counter, save"));
    }

    #[test]
    fn outline_never_carries_body() {
        let c = chunks("a.py", THREE_FUNCS, &config());
        for cand in &c {
            assert!(!cand.outline.contains("counter += 1"));
            assert!(cand.preview.chars().count() <= config().preview_chars);
        }
    }

    #[test]
    fn span_text_resolves_line_range() {
        let c = chunks("a.py", THREE_FUNCS, &config());
        let text = c[2].span_text(THREE_FUNCS);
        assert!(text.starts_with("def bump_counter"));
        assert!(text.ends_with("return counter"));
        assert_eq!(c[0].span_text(THREE_FUNCS), THREE_FUNCS);
    }

    #[test]
    fn editing_one_body_changes_only_that_symbol_hash() {
        let before = chunks("a.py", THREE_FUNCS, &config());
        let edited = THREE_FUNCS.replace("counter += 1", "counter += 2");
        let after = chunks("a.py", &edited, &config());
        assert_eq!(before[1].content_hash, after[1].content_hash);
        assert_ne!(before[2].content_hash, after[2].content_hash);
        assert_eq!(before[3].content_hash, after[3].content_hash);
    }

    #[test]
    fn small_class_kept_whole_with_nested_count() {
        let source = "class Counter:\n    def bump(self):\n        pass\n\n    def reset(self):\n        pass\n";
        let c = chunks("c.py", source, &config());
        assert_eq!(symbols(&c), vec!["Counter"]);
        assert_eq!(c[1].nested_symbols, 2);
        assert_eq!(c[1].line_range, Some((1, 6)));
    }

    #[test]
    fn oversized_class_splits_into_methods() {
        let cfg = ChunkerConfig {
            max_symbol_chars: 40,
            ..config()
        };
        let source = "class Counter:\n    def bump(self):\n        self.n += 1\n\n    def reset(self):\n        self.n = 0\n";
        let c = chunks("c.py", source, &cfg);
        assert_eq!(symbols(&c), vec!["Counter.bump", "Counter.reset"]);
        assert_eq!(c[1].line_range, Some((2, 3)));
        assert_eq!(c[2].line_range, Some((5, 6)));
    }

    #[test]
    fn duplicate_symbols_get_suffix() {
        let source = "def f():\n    return 1\n\ndef f():\n    return 2\n";
        let c = chunks("dup.py", source, &config());
        assert_eq!(symbols(&c), vec!["f", "f#2"]);
    }

    #[test]
    fn same_line_siblings_merge() {
        let source = "fn a() {}  fn b() {}\nfn c() {\n}\n";
        let c = chunks("x.rs", source, &config());
        assert_eq!(symbols(&c), vec!["a", "c"]);
        assert_eq!(c[1].nested_symbols, 1);
    }

    #[test]
    fn rust_trait_impl_named_after_trait() {
        let source = "struct Foo;\n\nimpl Display for Foo {\n    fn fmt(&self) {}\n}\n\nimpl Foo {\n    fn new() {}\n}\n";
        let c = chunks("foo.rs", source, &config());
        assert_eq!(symbols(&c), vec!["Foo", "Display for Foo", "Foo#2"]);
    }

    #[test]
    fn symbol_ranges_are_disjoint_and_ordered() {
        let source = "fn a() {\n    1;\n}\n\nstruct B {\n    x: u8,\n}\n\nimpl B {\n    fn c(&self) {}\n}\n";
        let c = chunks("lib.rs", source, &config());
        let ranges: Vec<_> = c.iter().filter_map(|c| c.line_range).collect();
        assert_eq!(ranges.len(), 3);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn toml_is_windowed() {
        let cfg = ChunkerConfig {
            target_chars: 30,
            min_chars: 5,
            max_chars: 60,
            ..config()
        };
        let source = "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = \"1\"\ntokio = \"1\"\n";
        let c = chunks("Cargo.toml", source, &cfg);
        assert!(c.len() >= 3);
        assert_eq!(c[1].symbol_path.as_deref(), Some("window:1"));
        assert_eq!(c[1].line_range.map(|r| r.0), Some(1));
        let last = c.last().unwrap().line_range.unwrap();
        assert_eq!(last.1, source.lines().count());
        assert!(c[0].outline.contains("split into"));
    }

    #[test]
    fn script_without_definitions_falls_back_to_windows() {
        let source = "import sys\nprint(sys.argv)\n";
        let c = chunks("run.py", source, &config());
        assert_eq!(symbols(&c), vec!["window:1"]);
    }

    #[test]
    fn plain_text_is_windowed() {
        let c = chunks("NOTES.txt", "remember the counter\n", &config());
        assert_eq!(c.len(), 2);
        assert_eq!(c[1].node_kind, "window");
    }

    #[test]
    fn markdown_sections_named_by_heading() {
        let source = "# Alpha\n\nFirst text.\n\n# Beta\n\nSecond text.\n";
        let c = chunks("README.md", source, &config());
        assert_eq!(symbols(&c), vec!["Alpha", "Beta"]);
        let lines = source.lines().count();
        let ranges: Vec<_> = c[1..].iter().filter_map(|c| c.line_range).collect();
        assert_eq!(ranges, vec![(1, 4), (5, lines)]);
        assert!(c[1..].iter().all(|c| c.nested_symbols == 0));
    }

    #[test]
    fn nested_markdown_section_stays_inside_its_parent() {
        let source = "# Title\n\nIntro text.\n\n## Install\n\nRun the installer.\n";
        let c = chunks("README.md", source, &config());
        assert_eq!(symbols(&c), vec!["Title"]);
        assert_eq!(c[1].line_range, Some((1, source.lines().count())));
    }

    #[test]
    fn degenerate_files_are_skipped() {
        let cfg = config();
        assert_eq!(
            extract("a.py", b"   \n\n", &cfg),
            Extracted::Skipped(SkipReason::Empty)
        );
        assert_eq!(
            extract("a.py", &[0xff, 0xfe, 0x00], &cfg),
            Extracted::Skipped(SkipReason::NotUtf8)
        );
        assert_eq!(
            extract("image.png", b"PNG", &cfg),
            Extracted::Skipped(SkipReason::Unsupported)
        );
        let small = ChunkerConfig {
            max_file_bytes: 4,
            ..cfg
        };
        assert!(matches!(
            extract("a.py", b"def f(): pass", &small),
            Extracted::Skipped(SkipReason::TooLarge { size: 13, max: 4 })
        ));
    }

    #[test]
    fn extraction_is_deterministic() {
        let a = chunks("a.py", THREE_FUNCS, &config());
        let b = chunks("a.py", THREE_FUNCS, &config());
        assert_eq!(a, b);
    }
}
