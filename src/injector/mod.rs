//! Payload injection into bee panes.
//!
//! The injector is the only path by which text reaches a hosted
//! interactive process. Every call is recorded in the append-only
//! injection log with the outcome that was actually observed, after the
//! multiplexer returned. The injector never retries; retry is the
//! caller's policy.
//!
//! Large payloads (multi-kilobyte role prompts) are split into chunks of
//! `chunk_size` characters typed back-to-back, followed by a short
//! confirm delay and a single Enter keypress, so the hosted process sees
//! one logical submission.
//!
//! Concurrency: panes are logically single-writer. A per-pane mutex
//! serializes concurrent callers targeting the same pane while callers
//! targeting different panes run in parallel, bounded overall by a
//! counting semaphore sized by `injector_concurrency`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::{HiveConfig, PaneMap};
use crate::models::BeeName;
use crate::store::{NewInjection, Store};
use crate::tmux::Multiplexer;
use crate::{CancelToken, Error, Result};

/// Options for one injection.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message type recorded in the log (e.g. `role_injection`)
    pub message_type: Option<String>,
    /// Sender recorded in the log
    pub sender: Option<String>,
    /// Opaque metadata recorded in the log
    pub metadata: Option<serde_json::Value>,
    /// Log the attempt without contacting the multiplexer
    pub dry_run: bool,
}

/// Counting semaphore bounding concurrent sends.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }
}

struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self.semaphore.permits.lock().unwrap();
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

/// Shared send limiter: the global concurrency bound plus the per-pane
/// write locks. Clone the `Arc` into every injector of one process so
/// the bounds hold across components.
pub struct SendLimiter {
    semaphore: Semaphore,
    pane_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SendLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent.max(1)),
            pane_locks: Mutex::new(HashMap::new()),
        }
    }

    fn pane_lock(&self, pane: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pane_locks.lock().unwrap();
        locks
            .entry(pane.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Delivers text payloads into bee panes, logging every attempt.
pub struct Injector {
    store: Store,
    mux: Arc<dyn Multiplexer>,
    panes: PaneMap,
    session_name: String,
    chunk_size: usize,
    confirm_delay: Duration,
    limiter: Arc<SendLimiter>,
    cancel: CancelToken,
}

impl Injector {
    pub fn new(store: Store, mux: Arc<dyn Multiplexer>, config: &HiveConfig) -> Self {
        Self::with_limiter(
            store,
            mux,
            config,
            Arc::new(SendLimiter::new(config.injector_concurrency)),
        )
    }

    /// Build an injector sharing an existing limiter, so several
    /// injectors in one process observe the same concurrency bound.
    pub fn with_limiter(
        store: Store,
        mux: Arc<dyn Multiplexer>,
        config: &HiveConfig,
        limiter: Arc<SendLimiter>,
    ) -> Self {
        Self {
            store,
            mux,
            panes: config.pane_map(),
            session_name: config.session_name.clone(),
            chunk_size: config.chunk_size,
            confirm_delay: Duration::from_millis(config.confirm_delay_ms),
            limiter,
            cancel: CancelToken::new(),
        }
    }

    /// The limiter, for sharing with sibling injectors.
    pub fn limiter(&self) -> Arc<SendLimiter> {
        self.limiter.clone()
    }

    /// Install a cancellation token checked before transport work.
    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Deliver a payload into the pane of the given bee.
    ///
    /// Returns the injection log ID on success. Errors are classified
    /// (`InvalidPane`, `Transport`, `Cancelled`); every attempt that got
    /// past pane resolution is logged with its observed outcome.
    pub fn send(&mut self, to: BeeName, payload: &str, opts: &SendOptions) -> Result<i64> {
        let pane = self.panes.resolve(to)?.to_string();

        if opts.dry_run {
            tracing::debug!(bee = %to, pane = %pane, "dry-run injection");
            return self.log(&pane, payload, opts, "dry_run");
        }

        if self.cancel.is_cancelled() {
            self.log(&pane, payload, opts, "cancelled")?;
            return Err(Error::Cancelled);
        }

        let outcome = {
            let _permit = self.limiter.semaphore.acquire();
            let pane_lock = self.limiter.pane_lock(&pane);
            let _pane_guard = pane_lock.lock().unwrap();
            self.deliver(&pane, payload)
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(bee = %to, pane = %pane, chars = payload.len(), "payload delivered");
                self.log(&pane, payload, opts, "delivered")
            }
            Err(e) => {
                tracing::warn!(bee = %to, pane = %pane, error = %e, "injection failed");
                self.log(&pane, payload, opts, e.outcome())?;
                Err(Error::Transport(e))
            }
        }
    }

    /// Type the payload in chunks, wait for the terminal to settle, then
    /// submit with Enter.
    fn deliver(&self, pane: &str, payload: &str) -> crate::tmux::MuxResult<()> {
        for chunk in chunk_payload(payload, self.chunk_size) {
            self.mux.send_text(pane, &chunk)?;
        }
        if !self.confirm_delay.is_zero() {
            std::thread::sleep(self.confirm_delay);
        }
        self.mux.send_enter(pane)
    }

    fn log(&mut self, pane: &str, payload: &str, opts: &SendOptions, outcome: &str) -> Result<i64> {
        self.store.append_injection(&NewInjection {
            session_name: &self.session_name,
            target_pane: pane,
            payload,
            message_type: opts.message_type.as_deref(),
            sender: opts.sender.as_deref(),
            metadata: opts.metadata.clone(),
            dry_run: opts.dry_run,
            outcome,
        })
    }
}

/// Split a payload into chunks of at most `size` characters, preserving
/// character boundaries.
fn chunk_payload(payload: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in payload.chars() {
        current.push(ch);
        count += 1;
        if count == size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    #[test]
    fn test_chunk_payload_short() {
        assert_eq!(chunk_payload("hello", 10), vec!["hello"]);
    }

    #[test]
    fn test_chunk_payload_exact() {
        assert_eq!(chunk_payload("abcdef", 3), vec!["abc", "def"]);
    }

    #[test]
    fn test_chunk_payload_remainder() {
        assert_eq!(chunk_payload("abcdefg", 3), vec!["abc", "def", "g"]);
    }

    #[test]
    fn test_chunk_payload_empty() {
        assert!(chunk_payload("", 10).is_empty());
    }

    #[test]
    fn test_chunk_payload_multibyte() {
        // Character boundaries, not byte boundaries
        let chunks = chunk_payload("日本語のテキスト", 3);
        assert_eq!(chunks, vec!["日本語", "のテキ", "スト"]);
    }

    #[test]
    fn test_send_delivers_and_logs() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        let id = injector
            .send(BeeName::Queen, "hello queen", &SendOptions::default())
            .unwrap();
        assert!(id > 0);

        assert_eq!(env.mux.sends_to("beehive:0"), vec!["hello queen"]);
        assert_eq!(env.mux.enters_to("beehive:0"), 1);

        let store = env.open_store();
        let log = store.recent_injections(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, "delivered");
        assert_eq!(log[0].payload, "hello queen");
        assert_eq!(log[0].session_name, "beehive");
    }

    #[test]
    fn test_send_chunks_large_payload() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        let payload = "x".repeat(9500);
        injector
            .send(BeeName::Developer, &payload, &SendOptions::default())
            .unwrap();

        let chunks = env.mux.sends_to("beehive:1");
        assert_eq!(chunks.len(), 3); // 4000 + 4000 + 1500
        assert_eq!(chunks[0].len(), 4000);
        assert_eq!(chunks[2].len(), 1500);
        assert_eq!(chunks.concat(), payload);
        // One logical submission
        assert_eq!(env.mux.enters_to("beehive:1"), 1);
    }

    #[test]
    fn test_dry_run_skips_transport() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        let opts = SendOptions {
            dry_run: true,
            message_type: Some("role_injection".to_string()),
            sender: Some("system".to_string()),
            ..Default::default()
        };
        let id = injector.send(BeeName::Qa, "pretend", &opts).unwrap();
        assert!(id > 0);

        assert!(env.mux.sends().is_empty());
        assert_eq!(env.mux.enters_to("beehive:2"), 0);

        let log = env.open_store().recent_injections(10).unwrap();
        assert_eq!(log[0].outcome, "dry_run");
        assert!(log[0].dry_run);
        assert_eq!(log[0].message_type.as_deref(), Some("role_injection"));
    }

    #[test]
    fn test_pane_failure_logged_not_retried() {
        let env = TestEnv::new();
        env.mux.fail_pane("beehive:1");
        let mut injector = env.injector();

        let err = injector
            .send(BeeName::Developer, "hello", &SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let log = env.open_store().recent_injections(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, "pane_not_found");

        // Exactly one attempt reached the fake: no automatic retry.
        assert!(env.mux.sends().is_empty());
    }

    #[test]
    fn test_synthetic_sender_has_no_pane() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        assert!(matches!(
            injector.send(BeeName::System, "hello", &SendOptions::default()),
            Err(Error::InvalidPane(_))
        ));
        // Resolution failure precedes logging.
        assert!(env.open_store().recent_injections(10).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_transport() {
        let env = TestEnv::new();
        let mut injector = env.injector();
        let token = CancelToken::new();
        injector.set_cancel_token(token.clone());
        token.cancel();

        assert!(matches!(
            injector.send(BeeName::Queen, "late", &SendOptions::default()),
            Err(Error::Cancelled)
        ));
        assert!(env.mux.sends().is_empty());

        let log = env.open_store().recent_injections(10).unwrap();
        assert_eq!(log[0].outcome, "cancelled");
    }

    #[test]
    fn test_sends_to_different_panes() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        injector
            .send(BeeName::Queen, "to queen", &SendOptions::default())
            .unwrap();
        injector
            .send(BeeName::Analyst, "to analyst", &SendOptions::default())
            .unwrap();

        assert_eq!(env.mux.sends_to("beehive:0"), vec!["to queen"]);
        assert_eq!(env.mux.sends_to("beehive:3"), vec!["to analyst"]);
    }

    #[test]
    fn test_metadata_recorded() {
        let env = TestEnv::new();
        let mut injector = env.injector();

        let opts = SendOptions {
            metadata: Some(serde_json::json!({"to_bee": "queen", "subject": "hi"})),
            ..Default::default()
        };
        injector.send(BeeName::Queen, "hello", &opts).unwrap();

        let log = env.open_store().recent_injections(10).unwrap();
        let metadata = log[0].metadata.as_ref().unwrap();
        assert_eq!(metadata["to_bee"], "queen");
    }
}
