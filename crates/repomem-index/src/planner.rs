//! Change planning: compare the repository tree to recorded index state.

use std::collections::BTreeMap;

use repomem_store::{IndexState, SchemaVersion};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexReason {
    /// No state recorded for the file.
    New,
    ContentChanged,
    /// Same content, different commit.
    CommitMoved,
    /// Indexed by an older chunk schema.
    SchemaUpgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Index(IndexReason),
    Unchanged,
    /// State exists but the file is gone from the tree.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub file_path: String,
    pub action: FileAction,
    /// Hash observed at planning time, `None` when the file could not be read.
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub repo_id: String,
    pub commit: String,
    /// Sorted by path.
    pub files: Vec<PlannedFile>,
}

impl Plan {
    pub fn to_index(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files
            .iter()
            .filter(|f| matches!(f.action, FileAction::Index(_)))
    }

    pub fn to_remove(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files.iter().filter(|f| f.action == FileAction::Remove)
    }

    #[must_use]
    pub fn unchanged(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.action == FileAction::Unchanged)
            .count()
    }
}

/// Build the minimal plan for one repository.
///
/// `files` holds every path currently in the tree with its fingerprint, or
/// `None` if it could not be read; unreadable files are planned for indexing
/// so the worker reports the failure.
#[must_use]
pub fn plan_changes(
    repo_id: &str,
    commit: &str,
    files: Vec<(String, Option<Fingerprint>)>,
    states: Vec<IndexState>,
) -> Plan {
    let mut states: BTreeMap<String, IndexState> = states
        .into_iter()
        .filter(|s| s.repo_id == repo_id)
        .map(|s| (s.file_path.clone(), s))
        .collect();

    let mut planned: Vec<PlannedFile> = files
        .into_iter()
        .map(|(file_path, fp)| {
            let content_hash = fp.map(|f| f.content_hash);
            let action = match (states.remove(&file_path), &content_hash) {
                (None, _) => FileAction::Index(IndexReason::New),
                (Some(_), None) => FileAction::Index(IndexReason::ContentChanged),
                (Some(state), Some(hash)) => {
                    if state.content_hash != *hash {
                        FileAction::Index(IndexReason::ContentChanged)
                    } else if state.schema_version != SchemaVersion::CURRENT {
                        FileAction::Index(IndexReason::SchemaUpgrade)
                    } else if state.last_indexed_commit != commit {
                        FileAction::Index(IndexReason::CommitMoved)
                    } else {
                        FileAction::Unchanged
                    }
                }
            };
            PlannedFile {
                file_path,
                action,
                content_hash,
            }
        })
        .collect();

    planned.extend(states.into_keys().map(|file_path| PlannedFile {
        file_path,
        action: FileAction::Remove,
        content_hash: None,
    }));
    planned.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    Plan {
        repo_id: repo_id.to_string(),
        commit: commit.to_string(),
        files: planned,
    }
}
