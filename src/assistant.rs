//! Note-taking assistant: builds prompts from the user's context, runs them
//! through the fallback chain, and applies the answer to the note store.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fallback::{FallbackChain, PromptRequest};
use crate::response::{ParsedResult, FALLBACK_TITLE};

pub const SYSTEM_PROMPT: &str = r#"You are an AI assistant that helps with note-taking and understanding web content.

You can help users:
1. Summarize selected text from web pages
2. Explain complex concepts in simple terms
3. Expand on brief notes with more details
4. Organize and structure information
5. Generate questions for study/review

Always respond with valid JSON in this format (no markdown, no code blocks):
{
  "action": "summarize" | "explain" | "expand" | "organize" | "question",
  "title": "Suggested note title",
  "content": "Generated note content in markdown format",
  "tags": ["tag1", "tag2"],
  "keyPoints": ["point 1", "point 2"]
}

Keep responses concise and actionable. Use markdown formatting for the content."#;

const AI_SECTION_HEADER: &str = "\n\n## AI Generated\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    pub source_url: String,
    pub page_title: String,
    pub tags: Vec<String>,
    pub ai_generated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub source_url: String,
    pub page_title: String,
    pub tags: Vec<String>,
    pub ai_generated: bool,
}

/// Fields to overwrite on an existing note; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Where notes live. Writes are fire-and-forget.
pub trait NoteStore: Send + Sync {
    fn create_note(&self, note: NewNote) -> NoteId;

    fn update_note(&self, id: &NoteId, patch: NotePatch);
}

/// In-memory [`NoteStore`].
#[derive(Clone, Default)]
pub struct MemoryNoteStore {
    notes: Arc<Mutex<Vec<Note>>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NoteId) -> Option<Note> {
        self.notes.lock().iter().find(|n| &n.id == id).cloned()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().clone()
    }
}

impl NoteStore for MemoryNoteStore {
    fn create_note(&self, note: NewNote) -> NoteId {
        let id = NoteId::new(uuid::Uuid::new_v4().to_string());
        let title = if note.title.is_empty() {
            "Untitled Note".to_string()
        } else {
            note.title
        };
        self.notes.lock().push(Note {
            id: id.clone(),
            title,
            content: note.content,
            source_url: note.source_url,
            page_title: note.page_title,
            tags: note.tags,
            ai_generated: note.ai_generated,
        });
        id
    }

    fn update_note(&self, id: &NoteId, patch: NotePatch) {
        let mut notes = self.notes.lock();
        let Some(note) = notes.iter_mut().find(|n| &n.id == id) else {
            tracing::debug!(note = id.as_str(), "update for unknown note ignored");
            return;
        };
        if let Some(content) = patch.content {
            note.content = content;
        }
        if let Some(tags) = patch.tags {
            note.tags = tags;
        }
    }
}

/// The web page the user is working from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub source_url: String,
    pub page_title: String,
}

/// Prefix `request` with the active note, if there is one.
pub fn compose_prompt(request: &str, active_note: Option<&Note>) -> String {
    match active_note {
        Some(note) => format!(
            "Current note context:\nTitle: {}\nContent: {}\n\nUser request: {}",
            note.title, note.content, request
        ),
        None => request.to_string(),
    }
}

/// Prompt offered for text the user selected on a page.
pub fn selection_prompt(page_title: &str, selected_text: &str) -> String {
    format!("Summarize this text from \"{page_title}\":\n\n{selected_text}")
}

/// One-click prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickAction {
    Summarize,
    Explain,
    Expand,
    Questions,
}

impl QuickAction {
    pub const ALL: [QuickAction; 4] = [
        QuickAction::Summarize,
        QuickAction::Explain,
        QuickAction::Expand,
        QuickAction::Questions,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            QuickAction::Summarize => "Summarize",
            QuickAction::Explain => "Explain",
            QuickAction::Expand => "Expand",
            QuickAction::Questions => "Questions",
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            QuickAction::Summarize => "Summarize this text",
            QuickAction::Explain => "Explain this concept in simple terms",
            QuickAction::Expand => "Expand on this with more details",
            QuickAction::Questions => "Generate study questions from this",
        }
    }
}

/// What a result was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Updated(NoteId),
    Created(NoteId),
}

pub struct Assistant {
    chain: FallbackChain,
    store: Arc<dyn NoteStore>,
    system_prompt: String,
}

impl Assistant {
    pub fn new(chain: FallbackChain, store: Arc<dyn NoteStore>) -> Self {
        Self {
            chain,
            store,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    /// Replace the built-in system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Answer `request` and apply the answer to the store. Every failure is
    /// reported as one human-readable message.
    pub async fn generate(
        &self,
        request: &str,
        active_note: Option<&Note>,
        page: Option<&PageContext>,
    ) -> Result<ParsedResult, String> {
        if request.trim().is_empty() {
            return Err("Enter a prompt first.".to_string());
        }

        let prompt = PromptRequest::new(
            compose_prompt(request, active_note),
            Some(self.system_prompt.as_str()),
        );
        let result = self.chain.run(&prompt).await.map_err(|e| e.to_string())?;
        self.apply(&result, active_note, page);
        Ok(result)
    }

    /// Append `result` to the active note, or create a new note from it.
    /// Results without content change nothing.
    pub fn apply(
        &self,
        result: &ParsedResult,
        active_note: Option<&Note>,
        page: Option<&PageContext>,
    ) -> Option<Applied> {
        let content = result.content()?;

        if let Some(note) = active_note {
            self.store.update_note(
                &note.id,
                NotePatch {
                    content: Some(format!("{}{}{}", note.content, AI_SECTION_HEADER, content)),
                    tags: Some(merge_tags(&note.tags, result.tags())),
                },
            );
            tracing::debug!(note = note.id.as_str(), "appended AI result to note");
            return Some(Applied::Updated(note.id.clone()));
        }

        let page = page.cloned().unwrap_or_default();
        let id = self.store.create_note(NewNote {
            title: result
                .title
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            content: content.to_string(),
            source_url: page.source_url,
            page_title: page.page_title,
            tags: result.tags().to_vec(),
            ai_generated: true,
        });
        tracing::debug!(note = id.as_str(), "created note from AI result");
        Some(Applied::Created(id))
    }
}

/// Existing tags first, then new ones, without duplicates.
fn merge_tags(existing: &[String], added: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .chain(added)
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect()
}
