use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::llm::LlmError;
use crate::state::{AgentState, StateStore};

/// Well-known delimiters marking the artifact span inside a rewrite reply.
pub const BEGIN_DELIMITER: &str = "#[BEGIN]";
pub const END_DELIMITER: &str = "#[END]";

/// The external rewrite collaborator, reduced to its narrow contract: current
/// artifact text plus a free-text request in, generated text out.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, current: &str, request: &str) -> Result<String, LlmError>;
}

/// Failure taxonomy for one pipeline run. Every variant leaves the on-disk
/// artifact byte-identical to its state before the run began.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("backup failed: {0}")]
    BackupFailed(String),
    #[error("rewrite call failed: {0}")]
    RewriteCallFailed(#[from] LlmError),
    #[error("generated artifact failed validation: {0}")]
    ValidationFailed(String),
    #[error("commit write failed: {0}")]
    CommitWriteFailed(String),
}

/// Result of a successfully committed mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub backup_path: PathBuf,
    pub mutation_count: u64,
}

/// Self-modification pipeline: backup, external rewrite, extract/validate,
/// atomic commit.
///
/// The whole span runs under one mutation gate, so at most one run is in
/// flight across all sessions. A request arriving while a run is in flight
/// suspends on the gate and then proceeds against whatever artifact the prior
/// run produced.
pub struct RewritePipeline {
    artifact_path: PathBuf,
    backup_dir: PathBuf,
    rewriter: Arc<dyn Rewriter>,
    gate: Mutex<()>,
}

impl RewritePipeline {
    pub fn new(artifact_path: PathBuf, backup_dir: PathBuf, rewriter: Arc<dyn Rewriter>) -> Self {
        Self {
            artifact_path,
            backup_dir,
            rewriter,
            gate: Mutex::new(()),
        }
    }

    pub fn artifact_path(&self) -> &PathBuf {
        &self.artifact_path
    }

    /// Wait for any in-flight run to finish. New runs cannot start while the
    /// returned guard is held, so a caller persisting a final state snapshot
    /// can never race a commit.
    pub async fn quiesce(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Run the full pipeline for one request.
    ///
    /// The mutation count increment and the store persist happen under the
    /// state write lock, after the artifact replace, so a concurrent reader
    /// never observes an incremented count without the matching persisted
    /// snapshot.
    pub async fn run(
        &self,
        request: &str,
        state: &RwLock<AgentState>,
        store: &StateStore,
    ) -> Result<MutationOutcome, PipelineError> {
        let _guard = self.gate.lock().await;

        let backup_path = self.backup()?;
        info!(backup = %backup_path.display(), "artifact backed up");

        let current = fs::read_to_string(&self.artifact_path)
            .map_err(|e| PipelineError::BackupFailed(format!("cannot read artifact: {e}")))?;

        let reply = self.rewriter.rewrite(&current, request).await?;

        let candidate = extract_candidate(&reply);
        validate_source(&candidate).map_err(PipelineError::ValidationFailed)?;

        self.commit(&candidate, backup_path, state, store).await
    }

    /// Copy the current artifact byte-for-byte into the backup directory.
    /// The pipeline never proceeds without a backup.
    fn backup(&self) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| PipelineError::BackupFailed(format!("cannot create backup dir: {e}")))?;

        let file_name = self
            .artifact_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::BackupFailed("artifact has no file name".to_string()))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let backup_path = self.backup_dir.join(format!("{file_name}.backup_{stamp}"));

        fs::copy(&self.artifact_path, &backup_path)
            .map_err(|e| PipelineError::BackupFailed(e.to_string()))?;
        Ok(backup_path)
    }

    /// Replace the artifact via temp-file-then-rename, then increment the
    /// mutation count and persist the store as one logical step.
    async fn commit(
        &self,
        candidate: &str,
        backup_path: PathBuf,
        state: &RwLock<AgentState>,
        store: &StateStore,
    ) -> Result<MutationOutcome, PipelineError> {
        let file_name = self
            .artifact_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::CommitWriteFailed("artifact has no file name".to_string())
            })?;
        let tmp = self.artifact_path.with_file_name(format!("{file_name}.tmp"));

        fs::write(&tmp, candidate).map_err(|e| PipelineError::CommitWriteFailed(e.to_string()))?;
        if let Err(e) = fs::rename(&tmp, &self.artifact_path) {
            let _ = fs::remove_file(&tmp);
            return Err(PipelineError::CommitWriteFailed(e.to_string()));
        }

        let mut st = state.write().await;
        st.mutation_count += 1;
        if let Err(e) = store.save(&st) {
            // Undo both halves so count, store and artifact stay in agreement.
            st.mutation_count -= 1;
            warn!(error = %e, "state persist failed after commit, rolling artifact back");
            if let Err(restore_err) = fs::copy(&backup_path, &self.artifact_path) {
                error!(
                    backup = %backup_path.display(),
                    error = %restore_err,
                    "artifact rollback from backup failed, manual recovery needed"
                );
            }
            return Err(PipelineError::CommitWriteFailed(format!(
                "state persist failed: {e}"
            )));
        }
        let mutation_count = st.mutation_count;
        drop(st);

        info!(
            mutations = mutation_count,
            artifact = %self.artifact_path.display(),
            "mutation committed, takes effect on next start"
        );
        Ok(MutationOutcome {
            backup_path,
            mutation_count,
        })
    }
}

/// Pull the candidate artifact out of a rewrite reply.
///
/// Precedence: the inclusive span between the first `#[BEGIN]` and the last
/// `#[END]` when both are present, else the inner content of the first fenced
/// code block, else the raw reply.
pub fn extract_candidate(reply: &str) -> String {
    if let Some(begin) = reply.find(BEGIN_DELIMITER) {
        if let Some(end) = reply.rfind(END_DELIMITER) {
            if end >= begin {
                return reply[begin..end + END_DELIMITER.len()].to_string();
            }
        }
    }

    if let Some(fence_start) = reply.find("```") {
        let after_fence = &reply[fence_start + 3..];
        // Skip an optional language tag on the fence line
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(fence_end) = body.find("```") {
            return body[..fence_end].trim().to_string();
        }
    }

    reply.trim().to_string()
}

/// Structural source check: the candidate must be non-empty and every brace,
/// bracket and parenthesis outside string, char and comment context must
/// balance. Candidates that fail never reach the commit stage.
pub fn validate_source(candidate: &str) -> Result<(), String> {
    if candidate.trim().is_empty() {
        return Err("candidate artifact is empty".to_string());
    }

    let chars: Vec<char> = candidate.chars().collect();
    let mut stack: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut depth = 1;
                i += 2;
                while i < chars.len() && depth > 0 {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                if depth > 0 {
                    return Err("unterminated block comment".to_string());
                }
                continue;
            }
            'r' if matches!(chars.get(i + 1), Some(&'"') | Some(&'#')) => {
                if let Some(consumed) = scan_raw_string(&chars[i..]) {
                    i += consumed;
                    continue;
                }
                i += 1;
            }
            '"' => {
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\\') => i += 2,
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                continue;
            }
            '\'' => {
                // Distinguish a char literal ('x', '\n') from a lifetime
                // ('a in &'a str): a literal always closes with a quote.
                if chars.get(i + 1) == Some(&'\\') {
                    i += 3;
                    while i < chars.len() && chars[i] != '\'' {
                        i += 1;
                    }
                    i += 1;
                } else if chars.get(i + 2) == Some(&'\'') {
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some(open) if open == expected => {}
                    Some(open) => {
                        return Err(format!("mismatched delimiter: '{open}' closed by '{c}'"))
                    }
                    None => return Err(format!("unexpected closing delimiter '{c}'")),
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some(open) = stack.pop() {
        return Err(format!("unclosed delimiter '{open}'"));
    }
    Ok(())
}

/// Length of a raw string literal (`r"..."`, `r#"..."#`, ...) starting at the
/// slice head, or None if the head is not one.
fn scan_raw_string(chars: &[char]) -> Option<usize> {
    let mut i = 1; // past 'r'
    let mut hashes = 0;
    while chars.get(i) == Some(&'#') {
        hashes += 1;
        i += 1;
    }
    if chars.get(i) != Some(&'"') {
        return None;
    }
    i += 1;
    while i < chars.len() {
        if chars[i] == '"' {
            let mut closing = 0;
            while closing < hashes && chars.get(i + 1 + closing) == Some(&'#') {
                closing += 1;
            }
            if closing == hashes {
                return Some(i + 1 + hashes);
            }
        }
        i += 1;
    }
    // Unterminated: report the rest as consumed so the balance check fails on
    // whatever the raw string swallowed.
    Some(chars.len())
}
