//! Approval manager: blocks a tool call on a human verdict, tracked by
//! a single-shot waiter per pending request, with a per-session trust cache
//! so once-approved tools stop prompting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POSITIVE_PHRASES: &[&str] = &[
    "yes", "y", "ok", "okay", "approve", "approved", "go ahead", "do it", "confirm", "confirmed",
    "sim", "pode", "aprovado", "aprovo", "vai", "confirmo", "confirmado",
];

const NEGATIVE_PHRASES: &[&str] = &[
    "no", "n", "deny", "denied", "cancel", "stop", "don't", "dont", "reject",
    "nao", "não", "cancela", "negado", "para", "rejeito",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied(String),
}

struct PendingRequest {
    session_id: String,
    tool_name: String,
    /// Monotonic creation order. Parallel tool dispatch can park several
    /// requests for one session; free-text replies resolve the newest.
    seq: u64,
    responder: Option<oneshot::Sender<Verdict>>,
}

/// Delivers the user-facing confirmation prompt for a parked request.
pub type SendUserMsg = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, PendingRequest>>,
    trust: Mutex<HashMap<String, std::collections::HashSet<String>>>,
    next_seq: AtomicU64,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            trust: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Request confirmation for a tool call. Returns immediately with
    /// `Approved` if the session already trusts this tool.
    pub async fn request(
        &self,
        session_id: &str,
        caller: &str,
        tool_name: &str,
        args: &serde_json::Value,
        send_user_msg: SendUserMsg,
    ) -> Verdict {
        if self.trust.lock().await.get(session_id).is_some_and(|set| set.contains(tool_name)) {
            return Verdict::Approved;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    session_id: session_id.to_string(),
                    tool_name: tool_name.to_string(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    responder: Some(tx),
                },
            );
        }

        let prompt = format!(
            "{caller} wants to run `{tool_name}` with args {args}. Reply yes/no to confirm."
        );
        send_user_msg(session_id, &prompt);

        let verdict = match tokio::time::timeout(DEFAULT_TIMEOUT, rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => Verdict::Denied("approval channel closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                send_user_msg(session_id, &format!("request to run `{tool_name}` timed out"));
                Verdict::Denied("timed out".to_string())
            }
        };

        debug!(request_id, tool_name, ?verdict, "approval resolved");
        verdict
    }

    /// Resolve a specific pending request. Idempotent: a second resolve on
    /// an already-answered or unknown request ID is a no-op.
    pub async fn resolve(&self, request_id: &str, approved: bool, note: Option<&str>) {
        let mut pending = self.pending.lock().await;
        if let Some(req) = pending.get_mut(request_id) {
            if let Some(responder) = req.responder.take() {
                let verdict = if approved {
                    Verdict::Approved
                } else {
                    Verdict::Denied(note.unwrap_or("denied by user").to_string())
                };
                let _ = responder.send(verdict);
            }
            pending.remove(request_id);
        }
    }

    /// Match free-text user input against positive/negative phrase sets for
    /// the most recent pending request belonging to `session_id`.
    pub async fn resolve_by_natural_language(&self, session_id: &str, user_text: &str) -> Option<Verdict> {
        let normalized = user_text.trim().to_lowercase();

        let request_id = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, req)| req.session_id == session_id)
                .max_by_key(|(_, req)| req.seq)
                .map(|(id, _)| id.clone())
        }?;

        let approved = if POSITIVE_PHRASES.iter().any(|p| &normalized == p) {
            true
        } else if NEGATIVE_PHRASES.iter().any(|p| &normalized == p) {
            false
        } else {
            return None;
        };

        self.resolve(&request_id, approved, None).await;
        Some(if approved { Verdict::Approved } else { Verdict::Denied("denied by user".to_string()) })
    }

    /// Suppress future confirmation prompts for `tool_name` within this
    /// session.
    pub async fn grant_trust(&self, session_id: &str, tool_name: &str) {
        let mut trust = self.trust.lock().await;
        trust.entry(session_id.to_string()).or_default().insert(tool_name.to_string());
        info!(session_id, tool_name, "trust granted for tool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_sender() -> SendUserMsg {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn trusted_tool_skips_prompt() {
        let mgr = ApprovalManager::new();
        mgr.grant_trust("s1", "shell_exec").await;
        let verdict = mgr
            .request("s1", "alice", "shell_exec", &serde_json::json!({}), noop_sender())
            .await;
        assert_eq!(verdict, Verdict::Approved);
    }

    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let mgr = Arc::new(ApprovalManager::new());
        let mgr2 = mgr.clone();

        let handle = tokio::spawn(async move {
            mgr2.request("s1", "alice", "write_file", &serde_json::json!({}), noop_sender()).await
        });

        // Give the request loop a moment to register as pending.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let request_id = {
            let pending = mgr.pending.lock().await;
            pending.keys().next().unwrap().clone()
        };
        mgr.resolve(&request_id, true, None).await;

        let verdict = handle.await.unwrap();
        assert_eq!(verdict, Verdict::Approved);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let mgr = ApprovalManager::new();
        mgr.resolve("nonexistent", true, None).await;
    }

    #[tokio::test]
    async fn natural_language_english_and_portuguese() {
        let mgr = Arc::new(ApprovalManager::new());
        let mgr2 = mgr.clone();
        let handle = tokio::spawn(async move {
            mgr2.request("s1", "alice", "write_file", &serde_json::json!({}), noop_sender()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let verdict = mgr.resolve_by_natural_language("s1", "sim").await;
        assert_eq!(verdict, Some(Verdict::Approved));
        assert_eq!(handle.await.unwrap(), Verdict::Approved);
    }

    #[tokio::test]
    async fn natural_language_resolves_most_recent_request() {
        let mgr = Arc::new(ApprovalManager::new());

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.request("s1", "alice", "write_file", &serde_json::json!({}), noop_sender()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.request("s1", "alice", "shell_exec", &serde_json::json!({}), noop_sender()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let verdict = mgr.resolve_by_natural_language("s1", "yes").await;
        assert_eq!(verdict, Some(Verdict::Approved));

        // The newer request (shell_exec) resolved; the older one is still
        // parked.
        assert_eq!(second.await.unwrap(), Verdict::Approved);
        assert!(!first.is_finished());
        let pending = mgr.pending.lock().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.values().next().unwrap().tool_name, "write_file");
    }

    #[tokio::test]
    async fn natural_language_unmatched_returns_none() {
        let mgr = Arc::new(ApprovalManager::new());
        let mgr2 = mgr.clone();
        let _handle = tokio::spawn(async move {
            mgr2.request("s1", "alice", "write_file", &serde_json::json!({}), noop_sender()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let verdict = mgr.resolve_by_natural_language("s1", "what time is it").await;
        assert_eq!(verdict, None);
    }
}
