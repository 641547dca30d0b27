//! Replicated Action Session
//!
//! One authoritative [`Sequencer`] puts every participant's submissions into a
//! single global order and broadcasts the committed frames. Each [`Participant`]
//! executes every frame, in sequence order, with its own handlers, so all
//! replicas apply the same effect log. Result callbacks fire only on the
//! participant that submitted the action.
//!
//! Both sides can be driven synchronously (`pump` / `sync`) or as async loops
//! (`run`) stopped by a broadcast shutdown signal.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error, info, instrument, warn};

use crate::actions::channel::{
    ActionChannel, ActionHandler, ActionRegistry, ChannelError, ResultCallback,
};
use crate::actions::protocol::{
    ActionError, ActionErrorCode, ActionResult, ActionSubmission, CommittedAction, ParticipantId,
};
use crate::core::sync::lock;

/// Default broadcast buffer, in frames.
pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A frame arrived out of sequence; this replica missed actions.
    #[error("replica diverged: expected seq {expected}, got {got}")]
    Diverged {
        /// Next sequence number this replica expected.
        expected: u64,
        /// Sequence number received.
        got: u64,
    },

    /// The broadcast buffer overflowed before this replica read it.
    #[error("replica lagged behind by {0} frames")]
    Lagged(u64),

    /// Frame encoding failed.
    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame args were not valid JSON.
    #[error("invalid frame args: {0}")]
    Args(#[from] serde_json::Error),

    /// The frame receiver is owned by a running `run` loop.
    #[error("frame receiver is busy")]
    ReceiverBusy,
}

// =============================================================================
// SEQUENCER
// =============================================================================

/// Authoritative ordering of all participants' submissions.
pub struct Sequencer {
    submit_tx: mpsc::UnboundedSender<ActionSubmission>,
    submit_rx: mpsc::UnboundedReceiver<ActionSubmission>,
    frame_tx: broadcast::Sender<Arc<[u8]>>,
    shutdown_tx: broadcast::Sender<()>,
    next_seq: u64,
}

impl Sequencer {
    /// Create a sequencer with the default frame buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }

    /// Create a sequencer buffering up to `capacity` unread frames per participant.
    pub fn with_capacity(capacity: usize) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (frame_tx, _) = broadcast::channel(capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            submit_tx,
            submit_rx,
            frame_tx,
            shutdown_tx,
            next_seq: 0,
        }
    }

    /// Add a participant. It receives every frame committed from now on.
    pub fn join(&self, id: ParticipantId) -> Participant {
        debug!("Participant {} joined at seq {}", id, self.next_seq);
        Participant {
            inner: Arc::new(ParticipantInner {
                id,
                registry: ActionRegistry::new(),
                submit_tx: self.submit_tx.clone(),
                frames: tokio::sync::Mutex::new(self.frame_tx.subscribe()),
                next_seq: AtomicU64::new(self.next_seq),
                next_ticket: AtomicU64::new(0),
                pending: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Sender that stops `run` loops subscribed to it.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Commit every submission currently waiting. Returns how many were committed.
    pub fn pump(&mut self) -> Result<usize, SessionError> {
        let mut committed = 0;
        while let Ok(submission) = self.submit_rx.try_recv() {
            self.commit(submission)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Commit submissions as they arrive until shutdown.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("Sequencer running");

        loop {
            tokio::select! {
                submission = self.submit_rx.recv() => {
                    match submission {
                        Some(submission) => self.commit(submission)?,
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Commit what was already submitted so replicas end on the same log.
        self.pump()?;
        info!("Sequencer stopped at seq {}", self.next_seq);
        Ok(())
    }

    fn commit(&mut self, submission: ActionSubmission) -> Result<(), SessionError> {
        let frame = CommittedAction::commit(self.next_seq, submission);
        let bytes: Arc<[u8]> = frame.to_bytes()?.into();
        self.next_seq += 1;

        if self.frame_tx.send(bytes).is_err() {
            debug!("Committed seq {} with no participants listening", frame.seq);
        } else {
            debug!("Committed seq {} {} from {}", frame.seq, frame.action, frame.origin);
        }
        Ok(())
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PARTICIPANT
// =============================================================================

struct ParticipantInner {
    id: ParticipantId,
    registry: ActionRegistry,
    submit_tx: mpsc::UnboundedSender<ActionSubmission>,
    frames: tokio::sync::Mutex<broadcast::Receiver<Arc<[u8]>>>,
    next_seq: AtomicU64,
    next_ticket: AtomicU64,
    pending: Mutex<BTreeMap<u64, ResultCallback>>,
}

/// One replica in a session. Cheap to clone.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

impl Participant {
    /// Participant id.
    pub fn id(&self) -> ParticipantId {
        self.inner.id
    }

    /// Next sequence number this replica will apply.
    pub fn applied_seq(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    /// Submissions still waiting for their committed frame.
    pub fn pending_results(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Apply every frame received so far. Returns how many were applied.
    pub fn sync(&self) -> Result<usize, SessionError> {
        let mut frames = self
            .inner
            .frames
            .try_lock()
            .map_err(|_| SessionError::ReceiverBusy)?;

        let mut applied = 0;
        loop {
            match frames.try_recv() {
                Ok(bytes) => {
                    self.apply_frame(&bytes)?;
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(applied),
                Err(TryRecvError::Lagged(n)) => return Err(SessionError::Lagged(n)),
            }
        }
    }

    /// Apply frames as they arrive until shutdown or the sequencer goes away.
    #[instrument(skip(self, shutdown_rx), fields(participant = self.inner.id))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), SessionError> {
        let mut frames = self.inner.frames.lock().await;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Ok(bytes) => self.apply_frame(&bytes)?,
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(n)) => {
                            error!("Participant {} lagged by {} frames", self.inner.id, n);
                            return Err(SessionError::Lagged(n));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Drain frames committed before shutdown.
                    while let Ok(bytes) = frames.try_recv() {
                        self.apply_frame(&bytes)?;
                    }
                    break;
                }
            }
        }

        debug!("Participant {} stopped at seq {}", self.inner.id, self.applied_seq());
        Ok(())
    }

    /// Execute one committed frame.
    fn apply_frame(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let frame = CommittedAction::from_bytes(bytes)?;

        let expected = self.inner.next_seq.load(Ordering::SeqCst);
        if frame.seq != expected {
            return Err(SessionError::Diverged {
                expected,
                got: frame.seq,
            });
        }
        self.inner.next_seq.store(expected + 1, Ordering::SeqCst);

        // Args were encoded by a participant; a bad payload is that action's failure,
        // not the replica's.
        let result = match frame.args_value() {
            Ok(args) => match self.inner.registry.get(&frame.action) {
                Some(handler) => handler.execute(args),
                None => ActionResult::rejected(ActionError::unknown_action(&frame.action)),
            },
            Err(e) => ActionResult::rejected(ActionError::invalid_args(e)),
        };

        if frame.origin == self.inner.id {
            let callback = lock(&self.inner.pending).remove(&frame.ticket);
            if let Some(callback) = callback {
                callback(result);
            }
        }
        Ok(())
    }
}

impl ActionChannel for Participant {
    fn register_action(&self, name: &str, handler: Arc<dyn ActionHandler>) -> Result<(), ChannelError> {
        self.inner.registry.register(name, handler)
    }

    fn execute_action(&self, name: &str, args: Value, callback: Option<ResultCallback>) {
        let reject = |error: ActionError, callback: Option<ResultCallback>| {
            warn!("Action {} refused on participant {}: {}", name, self.inner.id, error);
            if let Some(callback) = callback {
                callback(ActionResult::rejected(error));
            }
        };

        // Query runs here; refused submissions never reach the sequencer.
        let Some(handler) = self.inner.registry.get(name) else {
            return reject(ActionError::unknown_action(name), callback);
        };
        let query = handler.query(&args);
        if let Some(error) = query.error {
            return reject(error, callback);
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        let submission = match ActionSubmission::new(self.inner.id, ticket, name, &args) {
            Ok(submission) => submission,
            Err(e) => return reject(ActionError::invalid_args(e), callback),
        };

        if let Some(callback) = callback {
            lock(&self.inner.pending).insert(ticket, callback);
        }

        if self.inner.submit_tx.send(submission).is_err() {
            let callback = lock(&self.inner.pending).remove(&ticket);
            reject(
                ActionError::new(ActionErrorCode::Unavailable, "Session Closed", "The sequencer has stopped"),
                callback,
            );
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Appends executed values to a per-replica log.
    struct Append {
        log: Arc<Mutex<Vec<Value>>>,
    }

    impl ActionHandler for Append {
        fn query(&self, args: &Value) -> ActionResult {
            if args.is_null() {
                ActionResult::rejected(ActionError::invalid_args("null"))
            } else {
                ActionResult::ok()
            }
        }

        fn execute(&self, args: Value) -> ActionResult {
            lock(&self.log).push(args.clone());
            ActionResult::with_data(args)
        }
    }

    fn replica(sequencer: &Sequencer, id: ParticipantId) -> (Participant, Arc<Mutex<Vec<Value>>>) {
        let participant = sequencer.join(id);
        let log = Arc::new(Mutex::new(Vec::new()));
        participant
            .register_action("append", Arc::new(Append { log: log.clone() }))
            .unwrap();
        (participant, log)
    }

    #[test]
    fn test_all_replicas_apply_same_order() {
        let mut sequencer = Sequencer::new();
        let (a, log_a) = replica(&sequencer, 1);
        let (b, log_b) = replica(&sequencer, 2);

        a.execute_action("append", json!("a1"), None);
        b.execute_action("append", json!("b1"), None);
        a.execute_action("append", json!("a2"), None);

        // Nothing applies before the sequencer commits.
        assert!(lock(&log_a).is_empty());

        assert_eq!(sequencer.pump().unwrap(), 3);
        assert_eq!(a.sync().unwrap(), 3);
        assert_eq!(b.sync().unwrap(), 3);

        let expected = vec![json!("a1"), json!("b1"), json!("a2")];
        assert_eq!(*lock(&log_a), expected);
        assert_eq!(*lock(&log_b), expected);
        assert_eq!(a.applied_seq(), 3);
    }

    #[test]
    fn test_callback_only_on_origin() {
        let mut sequencer = Sequencer::new();
        let (a, _) = replica(&sequencer, 1);
        let (b, _) = replica(&sequencer, 2);

        let results = Arc::new(Mutex::new(Vec::new()));
        let slot = results.clone();
        a.execute_action("append", json!("x"), Some(Box::new(move |r: ActionResult| {
            lock(&slot).push(r);
        })));
        assert_eq!(a.pending_results(), 1);

        sequencer.pump().unwrap();
        b.sync().unwrap();
        assert!(lock(&results).is_empty());

        a.sync().unwrap();
        assert_eq!(*lock(&results), vec![ActionResult::with_data(json!("x"))]);
        assert_eq!(a.pending_results(), 0);
    }

    #[test]
    fn test_query_rejection_stays_local() {
        let mut sequencer = Sequencer::new();
        let (a, log_a) = replica(&sequencer, 1);

        let code = Arc::new(Mutex::new(None));
        let slot = code.clone();
        a.execute_action("append", Value::Null, Some(Box::new(move |r: ActionResult| {
            *lock(&slot) = r.error.map(|e| e.code);
        })));

        assert_eq!(*lock(&code), Some(ActionErrorCode::InvalidArgs));
        assert_eq!(sequencer.pump().unwrap(), 0);
        assert_eq!(a.sync().unwrap(), 0);
        assert!(lock(&log_a).is_empty());
    }

    #[test]
    fn test_lagging_replica_detected() {
        let mut sequencer = Sequencer::with_capacity(2);
        let (a, _) = replica(&sequencer, 1);

        for i in 0..4 {
            a.execute_action("append", json!(i), None);
        }
        sequencer.pump().unwrap();

        assert!(matches!(a.sync(), Err(SessionError::Lagged(_))));
    }

    #[test]
    fn test_out_of_order_frame_diverges() {
        let sequencer = Sequencer::new();
        let (a, _) = replica(&sequencer, 1);

        let submission = ActionSubmission::new(1, 0, "append", &json!("x")).unwrap();
        let frame = CommittedAction::commit(5, submission).to_bytes().unwrap();

        assert!(matches!(
            a.apply_frame(&frame),
            Err(SessionError::Diverged { expected: 0, got: 5 })
        ));
    }

    #[test]
    fn test_closed_sequencer_reports_unavailable() {
        let sequencer = Sequencer::new();
        let (a, _) = replica(&sequencer, 1);
        drop(sequencer);

        let code = Arc::new(Mutex::new(None));
        let slot = code.clone();
        a.execute_action("append", json!("x"), Some(Box::new(move |r: ActionResult| {
            *lock(&slot) = r.error.map(|e| e.code);
        })));

        assert_eq!(*lock(&code), Some(ActionErrorCode::Unavailable));
        assert_eq!(a.pending_results(), 0);
    }

    #[tokio::test]
    async fn test_async_loops_converge() {
        let sequencer = Sequencer::new();
        let shutdown = sequencer.shutdown_handle();
        let (a, log_a) = replica(&sequencer, 1);
        let (b, log_b) = replica(&sequencer, 2);

        let a_loop = tokio::spawn(a.clone().run(shutdown.subscribe()));
        let b_loop = tokio::spawn(b.clone().run(shutdown.subscribe()));
        let seq_loop = tokio::spawn(sequencer.run());

        for i in 0..10 {
            let submitter = if i % 2 == 0 { &a } else { &b };
            submitter.execute_action("append", json!(i), None);
        }

        // Wait until both replicas caught up, then stop everything.
        tokio::time::timeout(Duration::from_secs(5), async {
            while a.applied_seq() < 10 || b.applied_seq() < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.send(()).unwrap();
        seq_loop.await.unwrap().unwrap();
        a_loop.await.unwrap().unwrap();
        b_loop.await.unwrap().unwrap();

        assert_eq!(lock(&log_a).len(), 10);
        assert_eq!(*lock(&log_a), *lock(&log_b));
    }
}
