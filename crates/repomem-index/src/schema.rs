//! Chunk schema migrations, applied lazily on reuse or eagerly by backfill.

use repomem_store::{Chunk, SchemaVersion, chunk_id};

use crate::fingerprint::{estimate_tokens, truncate_chars};

/// Token cost assumed per source line when a chunk carries no estimate.
const TOKENS_PER_LINE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub chunk: Chunk,
    /// The embedding input changed and the vector must be regenerated.
    pub reembed: bool,
    /// Anything about the chunk changed.
    pub changed: bool,
}

/// Bring a chunk to [`SchemaVersion::CURRENT`].
///
/// `v1` chunks predate cost tracking and bounded previews: the id is
/// recomputed for `v2`, an over-long preview is truncated and a missing cost
/// estimate is filled in. A preview over the configured bound is truncated
/// at any version.
#[must_use]
pub fn migrate(mut chunk: Chunk, preview_chars: usize) -> Migrated {
    let mut changed = false;
    let mut reembed = false;

    if chunk.preview.chars().count() > preview_chars {
        chunk.preview = truncate_chars(&chunk.preview, preview_chars).to_string();
        changed = true;
        reembed = true;
    }

    if chunk.enrichment.schema_version == SchemaVersion::V1 {
        chunk.chunk_id = chunk_id(
            &chunk.repo_id,
            &chunk.file_path,
            chunk.symbol_path.as_deref(),
            SchemaVersion::V2,
        );
        if chunk.enrichment.cost_estimate == 0 {
            let tokens = match chunk.line_range {
                Some((start, end)) => (end + 1).saturating_sub(start) * TOKENS_PER_LINE,
                None => estimate_tokens(&chunk.summary_text),
            };
            chunk.enrichment.cost_estimate = u32::try_from(tokens).unwrap_or(u32::MAX);
        }
        chunk.enrichment.schema_version = SchemaVersion::V2;
        changed = true;
    }

    Migrated {
        chunk,
        reembed,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use repomem_store::{ChunkKind, EnrichmentLevel, EnrichmentRecord};

    use super::*;

    fn v1_chunk(preview: &str) -> Chunk {
        Chunk {
            chunk_id: chunk_id("r", "a.py", Some("f"), SchemaVersion::V1),
            kind: ChunkKind::SymbolIndex,
            repo_id: "r".into(),
            file_path: "a.py".into(),
            symbol_path: Some("f".into()),
            commit_sha: "c1".into(),
            line_range: Some((3, 7)),
            content_hash: "h".into(),
            summary_text: "Function `f` in a.py".into(),
            preview: preview.into(),
            embedding: vec![1.0, 0.0],
            enrichment: EnrichmentRecord {
                schema_version: SchemaVersion::V1,
                enrichment_level: EnrichmentLevel::Mechanical,
                cost_estimate: 0,
                underchunked: false,
            },
        }
    }

    #[test]
    fn v1_upgrades_id_and_cost() {
        let m = migrate(v1_chunk("def f():"), 300);
        assert!(m.changed);
        assert!(!m.reembed);
        assert_eq!(m.chunk.enrichment.schema_version, SchemaVersion::V2);
        assert_eq!(
            m.chunk.chunk_id,
            chunk_id("r", "a.py", Some("f"), SchemaVersion::V2)
        );
        assert_eq!(m.chunk.enrichment.cost_estimate, 50);
        assert_eq!(m.chunk.embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn long_preview_forces_reembed() {
        let m = migrate(v1_chunk(&"x".repeat(500)), 300);
        assert!(m.reembed);
        assert_eq!(m.chunk.preview.chars().count(), 300);
    }

    #[test]
    fn current_chunk_is_untouched() {
        let current = migrate(v1_chunk("def f():"), 300).chunk;
        let again = migrate(current.clone(), 300);
        assert!(!again.changed);
        assert!(!again.reembed);
        assert_eq!(again.chunk, current);
    }

    #[test]
    fn existing_cost_is_kept() {
        let mut chunk = v1_chunk("def f():");
        chunk.enrichment.cost_estimate = 7;
        assert_eq!(migrate(chunk, 300).chunk.enrichment.cost_estimate, 7);
    }
}
