//! Signaling Coordinator
//!
//! Exchanges descriptions, candidates, readiness and heartbeats between the
//! two roles of one (tour, language) channel through the shared
//! [`CoordinationStore`]. There is no relay: every exchange is a keyed write
//! the peer later reads.
//!
//! Read-modify-write of the coordination state goes through an optimistic
//! compare-and-swap transaction, retried with bounded exponential backoff on
//! conflicts and transient store errors.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tourlink_core::{
    signaling::Sender,
    store::keys,
    BatchAck, CandidateBatch, CasOutcome, ChannelKey, ConnectionPhase, CoordinationState,
    CoordinationStore, CoordinationUpdate, HealthReport, IceCandidate, IceCandidateRecord,
    Liveness, MessagePayload, MessageType, ParticipantId, ParticipantUpdate, Role,
    SignalingConfig, SignalingMessage, StoreError, TimeSource, Timestamp, TourlinkError,
    TourlinkResult,
};
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------------

/// What a transaction body decided to do with the value it read
#[derive(Debug)]
enum TxStep<T> {
    Write { value: T, ttl: Duration },
    Keep(Option<T>),
}

/// Result of a committed or skipped transaction
#[derive(Debug)]
enum TxOutcome<T> {
    Committed(T),
    Unchanged(Option<T>),
}

impl<T> TxOutcome<T> {
    fn into_value(self) -> Option<T> {
        match self {
            TxOutcome::Committed(value) => Some(value),
            TxOutcome::Unchanged(value) => value,
        }
    }
}

fn is_retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Timeout { .. } | StoreError::Unavailable { .. })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Read position in the channel's message list
#[derive(Debug, Clone, Default)]
struct MessageCursor {
    /// Entries of the current list consumed so far
    position: usize,
    /// Id at `position - 1`; a mismatch means the list expired and was recreated
    last_id: Option<String>,
}

// ----------------------------------------------------------------------------
// Signaling Coordinator
// ----------------------------------------------------------------------------

/// Store-backed signaling for one participant of a channel
pub struct SignalingCoordinator {
    store: Arc<dyn CoordinationStore>,
    channel: ChannelKey,
    role: Role,
    participant_id: ParticipantId,
    config: SignalingConfig,
    clock: Arc<dyn TimeSource>,
    message_cursor: Mutex<MessageCursor>,
    /// Messages sent before this instant belong to an earlier incarnation
    joined_at: Timestamp,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    transactions_retried: AtomicU64,
}

impl std::fmt::Debug for SignalingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingCoordinator")
            .field("channel", &self.channel)
            .field("role", &self.role)
            .field("participant_id", &self.participant_id)
            .finish()
    }
}

impl SignalingCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        channel: ChannelKey,
        role: Role,
        participant_id: ParticipantId,
        config: SignalingConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let joined_at = clock.now();
        Self {
            store,
            channel,
            role,
            participant_id,
            config,
            clock,
            message_cursor: Mutex::new(MessageCursor::default()),
            joined_at,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            transactions_retried: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Transaction attempts that had to be repeated
    pub fn transactions_retried(&self) -> u64 {
        self.transactions_retried.load(Ordering::Relaxed)
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn sender(&self) -> Sender {
        Sender {
            role: self.role,
            participant_id: self.participant_id.clone(),
        }
    }

    fn self_update(&self, connected: Option<bool>, gathering: Option<bool>) -> ParticipantUpdate {
        ParticipantUpdate {
            role: self.role,
            participant_id: self.participant_id.clone(),
            connected,
            ice_gathering_complete: gathering,
            touch: true,
        }
    }

    // ------------------------------------------------------------------------
    // Store Plumbing
    // ------------------------------------------------------------------------

    async fn backoff(&self, key: &str, attempt: u32, reason: &str) {
        self.transactions_retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.backoff_for(attempt);
        debug!(key, attempt, delay_ms = delay.as_millis() as u64, reason, "Retrying store operation");
        sleep(delay).await;
    }

    /// Run an unconditional store operation, retrying transient errors
    async fn retrying<T, F, Fut>(&self, key: &str, mut op: F) -> TourlinkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.config.max_transaction_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) => reason = err.to_string(),
                Err(err) => return Err(err.into()),
            }
            if attempt < attempts {
                self.backoff(key, attempt, &reason).await;
            }
        }
        Err(self.exhausted(key, attempts, reason))
    }

    fn exhausted(&self, key: &str, attempts: u32, reason: String) -> TourlinkError {
        warn!(key, attempts, %reason, "Signaling transaction exhausted its retries");
        TourlinkError::SignalingTransactionFailure {
            key: key.to_string(),
            attempts,
            reason,
        }
    }

    /// One optimistic read-modify-write; `Ok(None)` on a write conflict
    async fn try_transact<T, F>(&self, key: &str, apply: &mut F) -> TourlinkResult<Option<TxOutcome<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>, Timestamp) -> TxStep<T>,
    {
        let (version, current) = match self.store.get(key).await? {
            Some(stored) => (Some(stored.version), Some(decode::<T>(key, &stored.value)?)),
            None => (None, None),
        };

        match apply(current, self.now()) {
            TxStep::Keep(value) => Ok(Some(TxOutcome::Unchanged(value))),
            TxStep::Write { value, ttl } => {
                let encoded = serde_json::to_string(&value)?;
                match self.store.compare_and_swap(key, version, encoded, ttl).await? {
                    CasOutcome::Committed { version } => {
                        trace!(key, version, "Transaction committed");
                        Ok(Some(TxOutcome::Committed(value)))
                    }
                    CasOutcome::Conflict { .. } => Ok(None),
                }
            }
        }
    }

    /// Optimistic transaction with bounded retries
    ///
    /// Conflicts and transient store errors back off and retry; corrupt values
    /// and encoding errors fail immediately.
    async fn transact<T, F>(&self, key: &str, mut apply: F) -> TourlinkResult<TxOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>, Timestamp) -> TxStep<T>,
    {
        let attempts = self.config.max_transaction_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.try_transact(key, &mut apply).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => reason = "write conflict".to_string(),
                Err(TourlinkError::Store(err)) if is_retryable(&err) => reason = err.to_string(),
                Err(err) => return Err(err),
            }
            if attempt < attempts {
                self.backoff(key, attempt, &reason).await;
            }
        }
        Err(self.exhausted(key, attempts, reason))
    }

    // ------------------------------------------------------------------------
    // Coordination State
    // ------------------------------------------------------------------------

    fn merge_step(
        update: &CoordinationUpdate,
        current: Option<CoordinationState>,
        now: Timestamp,
        liveness_ttl: Duration,
        ttl: Duration,
    ) -> TxStep<CoordinationState> {
        let created = current.is_none();
        let mut base = current.unwrap_or_else(|| CoordinationState::new(now));
        let expired = base.apply_liveness_expiry(liveness_ttl, now);
        match update.merge(&base, now) {
            Some(next) => TxStep::Write { value: next, ttl },
            None if created || expired => TxStep::Write { value: base, ttl },
            None => TxStep::Keep(Some(base)),
        }
    }

    /// Create the channel state if absent and register this participant
    pub async fn initialize_coordination(&self) -> TourlinkResult<CoordinationState> {
        let update = CoordinationUpdate::default()
            .with_participant(self.self_update(Some(true), None))
            .with_heartbeat();
        let state = self.update_coordination_state(&update).await?;
        self.write_participant(&state).await?;
        debug!(
            channel = %self.channel,
            role = %self.role,
            participant = %self.participant_id,
            "Coordination initialized"
        );
        Ok(state)
    }

    /// Current channel state, `None` until some participant initialized it
    ///
    /// Participants whose liveness was not refreshed within the TTL read as
    /// disconnected.
    pub async fn get_coordination_state(&self) -> TourlinkResult<Option<CoordinationState>> {
        let key = keys::coordination(&self.channel);
        let Some(stored) = self.retrying(&key, || self.store.get(&key)).await? else {
            return Ok(None);
        };
        let mut state: CoordinationState = decode(&key, &stored.value)?;
        state.apply_liveness_expiry(self.config.participant_ttl, self.now());
        Ok(Some(state))
    }

    /// Merge a partial update into the channel state
    ///
    /// A merge that changes nothing is not written.
    pub async fn update_coordination_state(
        &self,
        update: &CoordinationUpdate,
    ) -> TourlinkResult<CoordinationState> {
        let key = keys::coordination(&self.channel);
        let liveness_ttl = self.config.participant_ttl;
        let ttl = self.config.coordination_ttl;
        let outcome = self
            .transact(&key, |current, now| {
                Self::merge_step(update, current, now, liveness_ttl, ttl)
            })
            .await?;
        Ok(outcome
            .into_value()
            .unwrap_or_else(|| CoordinationState::new(self.now())))
    }

    async fn write_participant(&self, state: &CoordinationState) -> TourlinkResult<()> {
        let Some(liveness) = state.liveness(self.role, &self.participant_id).copied() else {
            return Ok(());
        };
        let key = keys::participant(&self.channel, &self.participant_id);
        let encoded = serde_json::to_string(&liveness)?;
        let ttl = self.config.participant_ttl;
        self.retrying(&key, || self.store.set_with_ttl(&key, encoded.clone(), ttl))
            .await?;
        Ok(())
    }

    /// Liveness record this participant last wrote under its own key
    pub async fn participant_record(&self, id: &ParticipantId) -> TourlinkResult<Option<Liveness>> {
        let key = keys::participant(&self.channel, id);
        match self.retrying(&key, || self.store.get(&key)).await? {
            Some(stored) => Ok(Some(decode(&key, &stored.value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_phase(&self, phase: ConnectionPhase) -> TourlinkResult<CoordinationState> {
        self.update_coordination_state(&CoordinationUpdate::phase(phase))
            .await
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    pub async fn signal_ready(&self) -> TourlinkResult<CoordinationState> {
        let update = CoordinationUpdate::ready(self.role, true)
            .with_participant(self.self_update(Some(true), None));
        let state = self.update_coordination_state(&update).await?;
        debug!(channel = %self.channel, role = %self.role, "Signaled ready");
        Ok(state)
    }

    /// Poll until the peer role is ready; false once `wait` elapses
    pub async fn wait_for_peer_ready(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let peer = self.role.peer();
        loop {
            match self.get_coordination_state().await {
                Ok(Some(state)) if state.is_ready(peer) => return true,
                Ok(_) => {}
                Err(err) => debug!(error = %err, "Readiness poll failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(channel = %self.channel, ?peer, "Timed out waiting for peer readiness");
                return false;
            }
            sleep(self.config.ready_poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn signal_ice_gathering_complete(&self) -> TourlinkResult<CoordinationState> {
        let update =
            CoordinationUpdate::default().with_participant(self.self_update(None, Some(true)));
        self.update_coordination_state(&update).await
    }

    /// Refresh liveness and emit a heartbeat message
    pub async fn heartbeat(
        &self,
        report: Option<HealthReport>,
        target: Option<&ParticipantId>,
    ) -> TourlinkResult<()> {
        let update = CoordinationUpdate::default()
            .with_participant(self.self_update(None, None))
            .with_heartbeat();
        let state = self.update_coordination_state(&update).await?;
        self.write_participant(&state).await?;
        self.send_message(MessageType::Heartbeat, MessagePayload::Heartbeat { report }, target)
            .await?;
        trace!(channel = %self.channel, participant = %self.participant_id, "Heartbeat");
        Ok(())
    }

    /// Best-effort teardown write marking this participant gone
    ///
    /// A single attempt bounded by the teardown timeout; returns whether it
    /// committed.
    pub async fn leave(&self) -> bool {
        let key = keys::coordination(&self.channel);
        let update = CoordinationUpdate::ready(self.role, false).with_participant(ParticipantUpdate {
            touch: false,
            ..self.self_update(Some(false), None)
        });
        let liveness_ttl = self.config.participant_ttl;
        let ttl = self.config.coordination_ttl;
        let mut apply = |current: Option<CoordinationState>, now: Timestamp| match current {
            Some(current) => Self::merge_step(&update, Some(current), now, liveness_ttl, ttl),
            None => TxStep::Keep(None),
        };

        match timeout(
            self.config.teardown_write_timeout,
            self.try_transact(&key, &mut apply),
        )
        .await
        {
            Ok(Ok(Some(_))) => {
                debug!(channel = %self.channel, participant = %self.participant_id, "Left channel");
                true
            }
            Ok(Ok(None)) => {
                warn!(channel = %self.channel, "Leave write lost a conflict");
                false
            }
            Ok(Err(err)) => {
                warn!(channel = %self.channel, error = %err, "Leave write failed");
                false
            }
            Err(_) => {
                warn!(channel = %self.channel, "Leave write timed out");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Candidate Records
    // ------------------------------------------------------------------------

    /// Write one candidate record for the peer and index it
    pub async fn buffer_ice_candidate(
        &self,
        candidate: &IceCandidate,
        target: Option<&ParticipantId>,
        sequence_number: u64,
        batch_id: Option<u64>,
    ) -> TourlinkResult<IceCandidateRecord> {
        candidate.validate()?;
        let record = IceCandidateRecord {
            candidate_id: IceCandidateRecord::id_for(&self.participant_id, sequence_number),
            candidate: candidate.clone(),
            sender: self.role,
            sender_id: self.participant_id.clone(),
            target_id: target.cloned(),
            sequence_number,
            batch_id,
            timestamp: self.now(),
            processed: false,
        };

        let key = keys::ice_candidate(&self.channel, &record.candidate_id);
        let encoded = serde_json::to_string(&record)?;
        let ttl = self.config.ice_candidate_ttl;
        self.retrying(&key, || self.store.set_with_ttl(&key, encoded.clone(), ttl))
            .await?;

        let list = keys::ice_candidate_list(&self.channel);
        self.retrying(&list, || {
            self.store
                .list_append(&list, record.candidate_id.clone(), ttl)
        })
        .await?;
        trace!(candidate_id = %record.candidate_id, sequence_number, "Candidate record written");
        Ok(record)
    }

    /// Unexpired candidate records addressed to `target` (default: this
    /// participant), ordered by sequence number
    pub async fn get_ice_candidates(
        &self,
        target: Option<&ParticipantId>,
    ) -> TourlinkResult<Vec<IceCandidateRecord>> {
        let list = keys::ice_candidate_list(&self.channel);
        let ids = self
            .retrying(&list, || self.store.list_range(&list, 0))
            .await?;
        let target = target.unwrap_or(&self.participant_id);
        let ttl = self.config.ice_candidate_ttl;
        let now = self.now();

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            let key = keys::ice_candidate(&self.channel, &id);
            let Some(stored) = self.retrying(&key, || self.store.get(&key)).await? else {
                continue;
            };
            let record: IceCandidateRecord = match decode(&key, &stored.value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "Skipping undecodable candidate record");
                    continue;
                }
            };
            if record.timestamp.is_expired(ttl, now) {
                continue;
            }
            if record.is_addressed_to(self.role, target) {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.sequence_number);
        Ok(records)
    }

    /// Flag a record processed; returns false if absent or already flagged
    pub async fn mark_ice_candidate_processed(&self, candidate_id: &str) -> TourlinkResult<bool> {
        let key = keys::ice_candidate(&self.channel, candidate_id);
        let ttl = self.config.ice_candidate_ttl;
        let outcome = self
            .transact(&key, |current: Option<IceCandidateRecord>, now| match current {
                Some(record) if !record.processed => {
                    let remaining = (record.timestamp + ttl)
                        .duration_since(now)
                        .max(Duration::from_millis(1));
                    TxStep::Write {
                        value: IceCandidateRecord {
                            processed: true,
                            ..record
                        },
                        ttl: remaining,
                    }
                }
                other => TxStep::Keep(other),
            })
            .await?;
        Ok(matches!(outcome, TxOutcome::Committed(_)))
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Validate, store and index a message for the peer
    pub async fn send_message(
        &self,
        message_type: MessageType,
        payload: MessagePayload,
        target: Option<&ParticipantId>,
    ) -> TourlinkResult<SignalingMessage> {
        let message = SignalingMessage::new(
            message_type,
            self.sender(),
            target.cloned(),
            payload,
            self.now(),
        );
        message.validate()?;

        let key = keys::message(&self.channel, &message.message_id);
        let encoded = serde_json::to_string(&message)?;
        let ttl = self.config.message_ttl;
        self.retrying(&key, || self.store.set_with_ttl(&key, encoded.clone(), ttl))
            .await?;

        let list = keys::message_list(&self.channel);
        self.retrying(&list, || {
            self.store
                .list_append(&list, message.message_id.clone(), ttl)
        })
        .await?;

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        trace!(message_id = %message.message_id, ?message_type, "Message sent");
        Ok(message)
    }

    /// Messages addressed to this participant since the previous fetch
    ///
    /// The cursor only moves past messages that were read successfully. A
    /// store error mid-way returns what was read so far and resumes at the
    /// failed message on the next fetch.
    pub async fn fetch_messages(&self) -> TourlinkResult<Vec<SignalingMessage>> {
        let list = keys::message_list(&self.channel);
        let mut cursor = self.cursor().clone();
        let ids = self.unread_message_ids(&list, &mut cursor).await?;

        let mut inbound = Vec::new();
        for id in ids {
            let key = keys::message(&self.channel, &id);
            let stored = match self.retrying(&key, || self.store.get(&key)).await {
                Ok(stored) => stored,
                Err(err) => {
                    *self.cursor() = cursor;
                    if inbound.is_empty() {
                        return Err(err);
                    }
                    warn!(error = %err, "Message fetch interrupted, resuming on next poll");
                    return Ok(inbound);
                }
            };
            cursor.position += 1;
            cursor.last_id = Some(id);

            let Some(stored) = stored else {
                continue;
            };
            let message: SignalingMessage = match decode(&key, &stored.value) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "Skipping undecodable signaling message");
                    continue;
                }
            };
            if !message.is_addressed_to(self.role, &self.participant_id) {
                continue;
            }
            if message.timestamp < self.joined_at {
                trace!(message_id = %message.message_id, "Skipping message from before join");
                continue;
            }
            if let Err(err) = message.validate() {
                warn!(message_id = %message.message_id, error = %err, "Rejecting invalid message");
                continue;
            }
            self.messages_received.fetch_add(1, Ordering::Relaxed);
            inbound.push(message);
        }
        *self.cursor() = cursor;
        Ok(inbound)
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, MessageCursor> {
        self.message_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids past the cursor; restarts from the head when the list was recreated
    async fn unread_message_ids(
        &self,
        list: &str,
        cursor: &mut MessageCursor,
    ) -> TourlinkResult<Vec<String>> {
        let Some(last_id) = cursor.last_id.clone() else {
            return self.retrying(list, || self.store.list_range(list, 0)).await;
        };
        let start = cursor.position.saturating_sub(1);
        let mut ids = self
            .retrying(list, || self.store.list_range(list, start))
            .await?;
        if ids.first() == Some(&last_id) {
            ids.remove(0);
            return Ok(ids);
        }
        debug!(channel = %self.channel, "Message list was recreated, reading from the head");
        *cursor = MessageCursor::default();
        self.retrying(list, || self.store.list_range(list, 0)).await
    }

    /// Write every candidate record of a batch, then the batch message
    pub async fn send_candidate_batch(
        &self,
        batch: &CandidateBatch,
        target: Option<&ParticipantId>,
    ) -> TourlinkResult<()> {
        for sequenced in &batch.candidates {
            self.buffer_ice_candidate(
                &sequenced.candidate,
                target,
                sequenced.sequence_number,
                Some(batch.batch_id),
            )
            .await?;
        }
        self.send_message(
            MessageType::IceCandidateBatch,
            MessagePayload::Batch(batch.clone()),
            target,
        )
        .await?;
        debug!(batch_id = batch.batch_id, size = batch.len(), "Candidate batch sent");
        Ok(())
    }

    pub async fn acknowledge_batch(
        &self,
        ack: BatchAck,
        target: Option<&ParticipantId>,
    ) -> TourlinkResult<()> {
        let batch_id = ack.batch_id;
        self.send_message(
            MessageType::IceCandidateBatchAck,
            MessagePayload::BatchAck(ack),
            target,
        )
        .await?;
        trace!(batch_id, "Batch acknowledged");
        Ok(())
    }
}
