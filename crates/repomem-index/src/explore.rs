//! Bounded question-answering loop over the index.
//!
//! The model picks one action per turn from a fixed capability set
//! (`search`, `fetch_file`, `respond`). The loop is an explicit state
//! machine with an iteration cap; it never recurses.

use std::sync::Arc;

use repomem_llm::LlmProvider;
use repomem_llm::provider::Message;
use repomem_store::ChunkKind;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retriever::{HybridRetriever, SearchQuery, format_as_context};
use crate::source::RepoSource;

const EXPLORE_SYSTEM_PROMPT: &str = "You answer questions about a code repository using its \
index. Reply with exactly one JSON object per turn, choosing one action:\n\
{\"action\":\"search\",\"query\":\"...\",\"kind\":\"symbol_index\"} searches chunk summaries \
(kind is optional: repo_summary, module_summary, file_index, symbol_index)\n\
{\"action\":\"fetch_file\",\"path\":\"...\",\"start\":1,\"end\":40} reads a line range of a file\n\
{\"action\":\"respond\",\"answer\":\"...\"} gives the final answer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExploreConfig {
    pub max_iterations: usize,
    pub search_k: usize,
    /// Longest line range a single `fetch_file` may return.
    pub max_fetch_lines: usize,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            search_k: 5,
            max_fetch_lines: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Search {
        query: String,
        #[serde(default)]
        kind: Option<ChunkKind>,
    },
    FetchFile {
        path: String,
        start: usize,
        end: usize,
    },
    Respond {
        answer: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExploreState {
    AwaitingDecision,
    ExecutingTool(Action),
    Done(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exploration {
    /// Terminal state: [`ExploreState::Done`] or [`ExploreState::Failed`].
    pub state: ExploreState,
    /// Model turns taken.
    pub iterations: usize,
    /// Tool actions executed, in order.
    pub actions: Vec<Action>,
}

impl Exploration {
    #[must_use]
    pub fn answer(&self) -> Option<&str> {
        match &self.state {
            ExploreState::Done(answer) => Some(answer),
            _ => None,
        }
    }
}

pub struct Explorer<P> {
    provider: Arc<P>,
    retriever: Arc<HybridRetriever<P>>,
    source: Arc<dyn RepoSource>,
    repo_id: String,
    config: ExploreConfig,
}

impl<P: LlmProvider> Explorer<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        retriever: Arc<HybridRetriever<P>>,
        source: Arc<dyn RepoSource>,
        repo_id: impl Into<String>,
        config: ExploreConfig,
    ) -> Self {
        Self {
            provider,
            retriever,
            source,
            repo_id: repo_id.into(),
            config,
        }
    }

    /// Run the loop until the model responds or the iteration cap is hit.
    ///
    /// # Errors
    ///
    /// Currently infallible at this level: provider and tool failures end
    /// in [`ExploreState::Failed`] or are reported back to the model.
    pub async fn run(&self, question: &str) -> Result<Exploration> {
        let mut messages = vec![
            Message::system(EXPLORE_SYSTEM_PROMPT),
            Message::user(question),
        ];
        let mut state = ExploreState::AwaitingDecision;
        let mut iterations = 0usize;
        let mut actions = Vec::new();

        loop {
            state = match state {
                ExploreState::AwaitingDecision if iterations >= self.config.max_iterations => {
                    ExploreState::Failed(format!(
                        "no answer after {} iterations",
                        self.config.max_iterations
                    ))
                }
                ExploreState::AwaitingDecision => {
                    iterations += 1;
                    match self.provider.chat(&messages).await {
                        Ok(reply) => {
                            messages.push(Message::assistant(reply.clone()));
                            match parse_action(&reply) {
                                Ok(Action::Respond { answer }) => ExploreState::Done(answer),
                                Ok(action) => ExploreState::ExecutingTool(action),
                                Err(e) => {
                                    tracing::debug!(
                                        iteration = iterations,
                                        "unparseable action: {e}"
                                    );
                                    messages.push(Message::user(format!(
                                        "Invalid action ({e}). Reply with one JSON object."
                                    )));
                                    ExploreState::AwaitingDecision
                                }
                            }
                        }
                        Err(e) => ExploreState::Failed(format!("model unavailable: {e}")),
                    }
                }
                ExploreState::ExecutingTool(action) => {
                    let observation = self.execute(&action).await;
                    actions.push(action);
                    messages.push(Message::user(observation));
                    ExploreState::AwaitingDecision
                }
                terminal @ (ExploreState::Done(_) | ExploreState::Failed(_)) => {
                    let done = matches!(terminal, ExploreState::Done(_));
                    tracing::debug!(iterations, done, "exploration finished");
                    return Ok(Exploration {
                        state: terminal,
                        iterations,
                        actions,
                    });
                }
            };
        }
    }

    async fn execute(&self, action: &Action) -> String {
        match action {
            Action::Search { query, kind } => {
                let mut q = SearchQuery::text(query.clone(), self.config.search_k)
                    .in_repo(self.repo_id.clone());
                if let Some(kind) = kind {
                    q = q.with_kind(*kind);
                }
                match self.retriever.search(q).await {
                    Ok(hits) if hits.is_empty() => "No results.".to_string(),
                    Ok(hits) => format_as_context(&hits),
                    Err(e) => format!("Search failed: {e}"),
                }
            }
            Action::FetchFile { path, start, end } => {
                let start = (*start).max(1);
                let last = start.saturating_add(self.config.max_fetch_lines.saturating_sub(1));
                let end = (*end).max(start).min(last);
                let source = Arc::clone(&self.source);
                let (repo, file) = (self.repo_id.clone(), path.clone());
                let read = tokio::task::spawn_blocking(move || {
                    let commit = source.head_commit(&repo)?;
                    source.read_lines(&repo, &file, &commit, start, end)
                })
                .await;
                match read {
                    Ok(Ok(text)) => {
                        format!("<file path=\"{path}\" lines=\"{start}-{end}\">\n{text}\n</file>")
                    }
                    Ok(Err(e)) => format!("Fetch failed: {e}"),
                    Err(e) => format!("Fetch failed: {e}"),
                }
            }
            Action::Respond { answer } => answer.clone(),
        }
    }
}

/// Parse the first JSON object in a model reply.
///
/// # Errors
///
/// Returns an error if no object is present or it is not a valid action.
pub fn parse_action(reply: &str) -> std::result::Result<Action, serde_json::Error> {
    let start = reply.find('{').unwrap_or(0);
    let end = reply.rfind('}').map_or(reply.len(), |i| i + 1);
    let body = if start < end { &reply[start..end] } else { reply };
    serde_json::from_str(body)
}
