//! Mechanical repository and module summaries.
//!
//! Built from the file and symbol chunks already in the store. Module
//! summaries list each directory's files with their top-level symbols; the
//! repository summary gives counts and languages. Both fit a token budget.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use repomem_store::{Chunk, ChunkKind};

use crate::fingerprint::{estimate_tokens, hash_text};
use crate::languages::detect_language;

/// Store key of the repository summary.
pub const REPO_KEY: &str = "";
/// Store key of the module summary for the repository root directory.
pub const ROOT_MODULE_KEY: &str = "./";

const SYMBOLS_PER_FILE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryDraft {
    pub kind: ChunkKind,
    /// Reserved store key: [`REPO_KEY`] or a directory with a trailing `/`.
    pub key: String,
    pub summary_text: String,
    pub content_hash: String,
}

/// Module key for a file: its directory with a trailing `/`.
#[must_use]
pub fn module_key(file_path: &str) -> String {
    match file_path.rfind('/') {
        Some(i) => format!("{}/", &file_path[..i]),
        None => ROOT_MODULE_KEY.to_string(),
    }
}

/// Build one module summary per directory plus the repository summary.
#[must_use]
pub fn build_summaries(repo_id: &str, chunks: &[Chunk], token_budget: usize) -> Vec<SummaryDraft> {
    // module -> file -> symbols
    let mut modules: BTreeMap<String, BTreeMap<&str, Vec<&str>>> = BTreeMap::new();
    for chunk in chunks
        .iter()
        .filter(|c| c.repo_id == repo_id && c.kind.is_file_scoped())
    {
        let files = modules.entry(module_key(&chunk.file_path)).or_default();
        let symbols = files.entry(chunk.file_path.as_str()).or_default();
        if let Some(symbol) = chunk.symbol_path.as_deref()
            && !symbol.starts_with("window:")
        {
            symbols.push(symbol);
        }
    }
    if modules.is_empty() {
        return Vec::new();
    }

    let mut drafts: Vec<SummaryDraft> = modules
        .iter()
        .map(|(key, files)| {
            let text = module_text(repo_id, key, files, token_budget);
            draft(ChunkKind::ModuleSummary, key, text)
        })
        .collect();
    drafts.push(draft(
        ChunkKind::RepoSummary,
        REPO_KEY,
        repo_text(repo_id, &modules, token_budget),
    ));
    drafts
}

fn draft(kind: ChunkKind, key: &str, summary_text: String) -> SummaryDraft {
    SummaryDraft {
        kind,
        key: key.to_string(),
        content_hash: hash_text(&summary_text),
        summary_text,
    }
}

fn module_text(
    repo_id: &str,
    key: &str,
    files: &BTreeMap<&str, Vec<&str>>,
    token_budget: usize,
) -> String {
    let name = if key == ROOT_MODULE_KEY {
        "the top-level directory".to_string()
    } else {
        format!("module `{key}`")
    };
    let mut text = format!(
        "Summary of {name} in repository {repo_id}: {} files.",
        files.len()
    );

    let mut ordered: Vec<(&&str, &Vec<&str>)> = files.iter().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    let mut used = estimate_tokens(&text);
    for (idx, (path, symbols)) in ordered.iter().enumerate() {
        let mut line = format!("\n{path}");
        if !symbols.is_empty() {
            let shown: Vec<&str> = symbols.iter().take(SYMBOLS_PER_FILE).copied().collect();
            let _ = write!(line, " :: {}", shown.join(", "));
            if symbols.len() > SYMBOLS_PER_FILE {
                let _ = write!(line, " (+{} more)", symbols.len() - SYMBOLS_PER_FILE);
            }
        }
        let cost = estimate_tokens(&line);
        if used + cost > token_budget {
            let _ = write!(text, "\n... and {} more files", ordered.len() - idx);
            break;
        }
        text.push_str(&line);
        used += cost;
    }
    text
}

fn repo_text(
    repo_id: &str,
    modules: &BTreeMap<String, BTreeMap<&str, Vec<&str>>>,
    token_budget: usize,
) -> String {
    let files: usize = modules.values().map(BTreeMap::len).sum();
    let symbols: usize = modules
        .values()
        .flat_map(BTreeMap::values)
        .map(Vec::len)
        .sum();

    let mut languages: BTreeMap<&str, usize> = BTreeMap::new();
    for path in modules.values().flat_map(BTreeMap::keys) {
        let lang = detect_language(Path::new(path)).map_or("other", |l| l.id());
        *languages.entry(lang).or_default() += 1;
    }
    let languages: Vec<String> = languages
        .iter()
        .map(|(lang, n)| format!("{lang} ({n})"))
        .collect();

    let mut text = format!(
        "Repository {repo_id}: {files} files in {} modules, {symbols} symbols. \
         Languages: {}.\nModules:",
        modules.len(),
        languages.join(", ")
    );
    let mut used = estimate_tokens(&text);
    for (idx, (key, files)) in modules.iter().enumerate() {
        let line = format!("\n{key} ({} files)", files.len());
        let cost = estimate_tokens(&line);
        if used + cost > token_budget {
            let _ = write!(text, "\n... and {} more modules", modules.len() - idx);
            break;
        }
        text.push_str(&line);
        used += cost;
    }
    text
}
