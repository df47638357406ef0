//! Notes: persistent key-value text scoped per user.
//!
//! Storage: `{dir}/{scope}.json`, one JSON object per scope mapping note
//! names to their text.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Tool, ToolContext, ToolOutput};

/// Scoped key-value text storage.
#[async_trait]
pub trait NotesStore: Send + Sync {
    async fn read(&self, scope: &str, key: &str) -> anyhow::Result<Option<String>>;

    async fn write(&self, scope: &str, key: &str, value: &str) -> anyhow::Result<()>;

    /// Returns whether the note existed.
    async fn delete(&self, scope: &str, key: &str) -> anyhow::Result<bool>;

    /// Note names in a scope, sorted.
    async fn list(&self, scope: &str) -> anyhow::Result<Vec<String>>;
}

// --- FileNotesStore ---

pub struct FileNotesStore {
    base: PathBuf,
    /// Serialises read-modify-write cycles on scope files.
    lock: Mutex<()>,
}

impl FileNotesStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            lock: Mutex::new(()),
        }
    }
}

fn scope_path(base: &Path, scope: &str) -> PathBuf {
    // Sanitize scope to prevent path traversal
    let safe_name: String = scope
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    base.join(format!("{safe_name}.json"))
}

async fn load_scope(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&data)?)
}

async fn save_scope(path: &Path, data: &BTreeMap<String, String>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl NotesStore for FileNotesStore {
    async fn read(&self, scope: &str, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let data = load_scope(&scope_path(&self.base, scope)).await?;
        Ok(data.get(key).cloned())
    }

    async fn write(&self, scope: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = scope_path(&self.base, scope);
        let mut data = load_scope(&path).await?;
        data.insert(key.to_string(), value.to_string());
        save_scope(&path, &data).await
    }

    async fn delete(&self, scope: &str, key: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let path = scope_path(&self.base, scope);
        let mut data = load_scope(&path).await?;
        if data.remove(key).is_none() {
            return Ok(false);
        }
        save_scope(&path, &data).await?;
        Ok(true)
    }

    async fn list(&self, scope: &str) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let data = load_scope(&scope_path(&self.base, scope)).await?;
        Ok(data.into_keys().collect())
    }
}

// --- MemoryNotesStore ---

#[derive(Default)]
pub struct MemoryNotesStore {
    scopes: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryNotesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotesStore for MemoryNotesStore {
    async fn read(&self, scope: &str, key: &str) -> anyhow::Result<Option<String>> {
        let scopes = self.scopes.lock().await;
        Ok(scopes.get(scope).and_then(|s| s.get(key)).cloned())
    }

    async fn write(&self, scope: &str, key: &str, value: &str) -> anyhow::Result<()> {
        self.scopes
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> anyhow::Result<bool> {
        let mut scopes = self.scopes.lock().await;
        Ok(scopes
            .get_mut(scope)
            .is_some_and(|s| s.remove(key).is_some()))
    }

    async fn list(&self, scope: &str) -> anyhow::Result<Vec<String>> {
        let scopes = self.scopes.lock().await;
        Ok(scopes
            .get(scope)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// --- NotesTool ---

/// Editor-style access to the caller's notes.
pub struct NotesTool {
    store: Arc<dyn NotesStore>,
}

impl NotesTool {
    pub fn new(store: Arc<dyn NotesStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum NotesCommand {
    View {
        #[serde(default)]
        path: Option<String>,
    },
    Write {
        path: String,
        content: String,
    },
    Append {
        path: String,
        content: String,
    },
    StrReplace {
        path: String,
        old_str: String,
        #[serde(default)]
        new_str: String,
    },
    Delete {
        path: String,
    },
}

#[async_trait]
impl Tool for NotesTool {
    fn name(&self) -> &str {
        "notes"
    }

    fn description(&self) -> &str {
        "Persistent notes that survive across conversations. Commands: view (list notes, or \
         show one with `path`), write, append, str_replace (replace a unique occurrence of \
         `old_str` with `new_str`), delete."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["view", "write", "append", "str_replace", "delete"]
                },
                "path": {
                    "type": "string",
                    "description": "Note name"
                },
                "content": {
                    "type": "string",
                    "description": "Text for write and append"
                },
                "old_str": { "type": "string" },
                "new_str": { "type": "string" }
            },
            "required": ["command"]
        })
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let command: NotesCommand = serde_json::from_value(input)?;
        let scope = context.user_id.as_str();

        match command {
            NotesCommand::View { path: None } => {
                debug!(user = %scope, "notes view");
                let names = self.store.list(scope).await?;
                if names.is_empty() {
                    return Ok(ToolOutput::text("No notes yet."));
                }
                Ok(ToolOutput::text(format!(
                    "Notes ({}):\n{}",
                    names.len(),
                    names.join("\n")
                )))
            }
            NotesCommand::View { path: Some(path) } => {
                debug!(user = %scope, %path, "notes view");
                match self.store.read(scope, &path).await? {
                    Some(text) => Ok(ToolOutput::text(text)),
                    None => Ok(ToolOutput::error(format!("Note '{path}' not found"))),
                }
            }
            NotesCommand::Write { path, content } => {
                debug!(user = %scope, %path, "notes write");
                self.store.write(scope, &path, &content).await?;
                Ok(ToolOutput::text(format!("Saved note '{path}'")))
            }
            NotesCommand::Append { path, content } => {
                debug!(user = %scope, %path, "notes append");
                let updated = match self.store.read(scope, &path).await? {
                    Some(existing) if !existing.is_empty() => format!("{existing}\n{content}"),
                    _ => content,
                };
                self.store.write(scope, &path, &updated).await?;
                Ok(ToolOutput::text(format!("Appended to note '{path}'")))
            }
            NotesCommand::StrReplace {
                path,
                old_str,
                new_str,
            } => {
                debug!(user = %scope, %path, "notes str_replace");
                let Some(existing) = self.store.read(scope, &path).await? else {
                    return Ok(ToolOutput::error(format!("Note '{path}' not found")));
                };
                match existing.matches(old_str.as_str()).count() {
                    0 => Ok(ToolOutput::error(format!("Text not found in note '{path}'"))),
                    1 => {
                        let updated = existing.replacen(old_str.as_str(), &new_str, 1);
                        self.store.write(scope, &path, &updated).await?;
                        Ok(ToolOutput::text(format!("Updated note '{path}'")))
                    }
                    n => Ok(ToolOutput::error(format!(
                        "Text occurs {n} times in note '{path}'; make it unique"
                    ))),
                }
            }
            NotesCommand::Delete { path } => {
                debug!(user = %scope, %path, "notes delete");
                if self.store.delete(scope, &path).await? {
                    Ok(ToolOutput::text(format!("Deleted note '{path}'")))
                } else {
                    Ok(ToolOutput::error(format!("Note '{path}' not found")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::types::ToolResultContent;

    fn ctx(user: &str) -> ToolContext {
        ToolContext {
            user_id: user.into(),
            conversation_id: "c1".into(),
        }
    }

    fn text(out: &ToolOutput) -> &str {
        match &out.content[0] {
            ToolResultContent::Text(t) => t,
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn test_scope_path_sanitization() {
        let base = PathBuf::from("/tmp/notes");
        assert_eq!(
            scope_path(&base, "alice"),
            PathBuf::from("/tmp/notes/alice.json")
        );
        assert_eq!(
            scope_path(&base, "../escape"),
            PathBuf::from("/tmp/notes/___escape.json")
        );
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNotesStore::new(dir.path().to_path_buf());
        store.write("alice", "todo", "buy milk").await.unwrap();
        store.write("alice", "ideas", "x").await.unwrap();

        assert_eq!(store.read("alice", "todo").await.unwrap().as_deref(), Some("buy milk"));
        assert_eq!(store.list("alice").await.unwrap(), vec!["ideas", "todo"]);
        assert!(store.list("bob").await.unwrap().is_empty());

        assert!(store.delete("alice", "todo").await.unwrap());
        assert!(!store.delete("alice", "todo").await.unwrap());
        assert!(!dir.path().join("alice.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_notes_tool_commands() {
        let tool = NotesTool::new(Arc::new(MemoryNotesStore::new()));
        let alice = ctx("alice");

        let out = tool.invoke(json!({"command": "view"}), &alice).await.unwrap();
        assert_eq!(text(&out), "No notes yet.");

        tool.invoke(json!({"command": "write", "path": "plan", "content": "step one"}), &alice)
            .await
            .unwrap();
        tool.invoke(json!({"command": "append", "path": "plan", "content": "step two"}), &alice)
            .await
            .unwrap();
        let out = tool
            .invoke(
                json!({"command": "str_replace", "path": "plan", "old_str": "one", "new_str": "1"}),
                &alice,
            )
            .await
            .unwrap();
        assert!(!out.is_error);

        let out = tool
            .invoke(json!({"command": "view", "path": "plan"}), &alice)
            .await
            .unwrap();
        assert_eq!(text(&out), "step 1\nstep two");

        // Scoped per user.
        let out = tool
            .invoke(json!({"command": "view", "path": "plan"}), &ctx("bob"))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn test_str_replace_requires_unique_match() {
        let store = Arc::new(MemoryNotesStore::new());
        store.write("alice", "n", "a a").await.unwrap();
        let tool = NotesTool::new(store);
        let out = tool
            .invoke(
                json!({"command": "str_replace", "path": "n", "old_str": "a", "new_str": "b"}),
                &ctx("alice"),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(text(&out).contains("2 times"));
    }

    #[tokio::test]
    async fn test_bad_command_is_error() {
        let tool = NotesTool::new(Arc::new(MemoryNotesStore::new()));
        assert!(tool
            .invoke(json!({"command": "format_disk"}), &ctx("alice"))
            .await
            .is_err());
    }
}
