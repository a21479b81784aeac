// =============================================================================
// Orbiton Matrix Homeserver Core - Event Evaluation Pipeline
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The single funnel every event passes through before durable commit,
//   locally injected or remotely received. Evaluation is an ordered phase
//   sequence: issue, access, verify, dependency fetches, conformity, the
//   three authorization passes, write, notify, retire. Index allocation is
//   FIFO with admission; completion may be out of order; `committed` is the
//   visibility watermark. Failure severity per phase is governed by the
//   evaluation's nothrows mask: hard failures abandon the index, soft
//   failures write the event without applying it to heads or state.
//
// Architecture:
//   • ISSUE allocates the index at admission, before any dependency work,
//     keeping issue order FIFO with arrival
//   • The dependency stage (access, verify, fetch_auth, fetch_prev,
//     auth_static) runs without the room lock, so nested evaluations of
//     fetched dependencies cannot deadlock
//   • The commit stage (fetch_state, conform, auth_rela, auth_pres, write,
//     notify) serializes under the per-room lock; a duplicate admitted by a
//     concurrent evaluation is settled there, abandoning the loser's index
//   • A static dispatch over the phase enum; no dynamic dispatch
//
// =============================================================================

pub mod sequence;

use std::{collections::HashMap, sync::Arc};

use ruma::{
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedRoomId, OwnedServerName, OwnedUserId,
    RoomId, RoomVersionId, ServerName, UInt,
};
use serde_json::value::RawValue as RawJsonValue;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    service::{
        pdu::{gen_event_id_canonical_json, PduBuilder, PduEvent},
        rooms::{event_auth, state_res, timeline::EventCommit, RoomVersion},
    },
    services, Error, Result,
};

pub use sequence::{Counters, Sequence};

/// The evaluation phases, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Phase {
    Issue,
    Access,
    Verify,
    FetchAuth,
    FetchPrev,
    FetchState,
    Conform,
    AuthStatic,
    AuthRela,
    AuthPres,
    Write,
    Notify,
    Retire,
}

impl Phase {
    pub const ALL: [Phase; 13] = [
        Phase::Issue,
        Phase::Access,
        Phase::Verify,
        Phase::FetchAuth,
        Phase::FetchPrev,
        Phase::FetchState,
        Phase::Conform,
        Phase::AuthStatic,
        Phase::AuthRela,
        Phase::AuthPres,
        Phase::Write,
        Phase::Notify,
        Phase::Retire,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Issue => "ISSUE",
            Phase::Access => "ACCESS",
            Phase::Verify => "VERIFY",
            Phase::FetchAuth => "FETCH_AUTH",
            Phase::FetchPrev => "FETCH_PREV",
            Phase::FetchState => "FETCH_STATE",
            Phase::Conform => "CONFORM",
            Phase::AuthStatic => "AUTH_STATIC",
            Phase::AuthRela => "AUTH_RELA",
            Phase::AuthPres => "AUTH_PRES",
            Phase::Write => "WRITE",
            Phase::Notify => "NOTIFY",
            Phase::Retire => "RETIRE",
        }
    }

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of phases, for the nothrows mask and per-phase enablement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseMask(u16);

impl PhaseMask {
    pub const EMPTY: PhaseMask = PhaseMask(0);
    pub const ALL: PhaseMask = PhaseMask(u16::MAX);

    pub const fn with(self, phase: Phase) -> Self {
        PhaseMask(self.0 | phase.bit())
    }

    pub const fn without(self, phase: Phase) -> Self {
        PhaseMask(self.0 & !phase.bit())
    }

    pub const fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }
}

/// Options of one evaluation.
#[derive(Clone, Debug)]
pub struct EvalOpts {
    /// Whether NOTIFY forwards the committed event to federation peers.
    pub notify_servers: bool,
    /// Accept an event whose event_id already exists (idempotent re-eval).
    pub replays: bool,
    /// Phases whose hard failure is downgraded to a soft failure.
    pub nothrows: PhaseMask,
    /// Enabled phases; debugging tools and trusted bulk loads narrow this.
    pub phases: PhaseMask,
    /// Whether the commit updates the head set.
    pub room_head: bool,
    /// Force a full head-and-state recomputation after commit.
    pub room_head_resolve: bool,
    /// Submitting server, for ACCESS and logging.
    pub node_id: Option<OwnedServerName>,
    /// Submitting user, for ACCESS and logging.
    pub user_id: Option<OwnedUserId>,
    pub infolog_accept: bool,
    pub debuglog_accept: bool,
    /// Cap on events consumed when the input is a batch.
    pub limit: Option<usize>,
}

impl EvalOpts {
    /// Local injection: everything is hard, peers get notified, we signed
    /// the event ourselves so VERIFY is off.
    pub fn local() -> Self {
        Self {
            notify_servers: true,
            replays: false,
            nothrows: PhaseMask::EMPTY,
            phases: PhaseMask::ALL.without(Phase::Verify),
            room_head: true,
            room_head_resolve: false,
            node_id: None,
            user_id: None,
            infolog_accept: false,
            debuglog_accept: true,
            limit: None,
        }
    }

    /// Inbound federation: missing causality and relative auth soft-fail;
    /// no re-broadcast.
    pub fn federation() -> Self {
        Self {
            notify_servers: false,
            replays: false,
            nothrows: PhaseMask::EMPTY
                .with(Phase::FetchPrev)
                .with(Phase::FetchState)
                .with(Phase::AuthRela),
            phases: PhaseMask::ALL,
            room_head: true,
            room_head_resolve: false,
            node_id: None,
            user_id: None,
            infolog_accept: false,
            debuglog_accept: true,
            limit: None,
        }
    }
}

/// Failure of an evaluation, by severity. Soft failures are not faults: the
/// event commits, unapplied, and the result carries the flag.
#[derive(Debug)]
pub enum Fault {
    /// Permanently rejected; the issued index is abandoned.
    Fail { phase: Phase, error: Error },
    /// Transient; caller policy decides backoff.
    Retry { phase: Phase, error: Error },
}

impl Fault {
    pub fn error(self) -> Error {
        match self {
            Fault::Fail { error, .. } | Fault::Retry { error, .. } => error,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Fault::Fail { phase, .. } | Fault::Retry { phase, .. } => *phase,
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        fault.error()
    }
}

/// What an accepted evaluation produced.
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub event_id: Arc<EventId>,
    pub idx: u64,
    /// Written for reference and causality, not applied to heads or state.
    pub soft_failed: bool,
}

/// Soft-failure bookkeeping across the phase run.
struct SoftState {
    failed: bool,
}

fn soften(
    opts: &EvalOpts,
    soft: &mut SoftState,
    phase: Phase,
    error: Error,
) -> Result<(), Fault> {
    if opts.nothrows.contains(phase) {
        warn!(phase = phase.name(), %error, "soft failure");
        soft.failed = true;
        Ok(())
    } else if matches!(error, Error::Timeout(_) | Error::Incomplete) {
        Err(Fault::Retry { phase, error })
    } else {
        Err(Fault::Fail { phase, error })
    }
}

fn hard(phase: Phase, error: Error) -> Fault {
    Fault::Fail { phase, error }
}

/// Everything the dependency stage hands the commit stage.
struct Prepared {
    event_id: Arc<EventId>,
    value: CanonicalJsonObject,
    pdu: Arc<PduEvent>,
    room_version: RoomVersion,
    missing_prevs: Vec<Arc<EventId>>,
    soft: SoftState,
}

pub struct Service {
    pub sequence: Sequence,
    room_mutexes: RwLock<HashMap<OwnedRoomId, Arc<Mutex<()>>>>,
}

impl Service {
    pub fn new(highest_durable: u64) -> Self {
        Self {
            sequence: Sequence::new(highest_durable),
            room_mutexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn counters(&self) -> Counters {
        self.sequence.counters()
    }

    async fn room_mutex(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.room_mutexes
                .write()
                .await
                .entry(room_id.to_owned())
                .or_default(),
        )
    }

    /// Builds, signs and evaluates a locally-authored event.
    #[tracing::instrument(skip(self, builder))]
    pub async fn inject(
        &self,
        builder: PduBuilder,
        sender: &ruma::UserId,
        room_id: &RoomId,
        mut opts: EvalOpts,
    ) -> Result<EvalResult, Fault> {
        opts.user_id = Some(sender.to_owned());

        let mutex = self.room_mutex(room_id).await;
        let guard = mutex.lock().await;

        let (pdu, value) = services()
            .rooms
            .timeline
            .create_event(builder, sender, room_id)
            .map_err(|error| hard(Phase::Conform, error))?;

        let room_version = room_version_of(&value).map_err(|e| hard(Phase::Conform, e))?;
        let event_id = pdu.event_id.clone();

        // ISSUE: freshly built events are always new.
        let idx = self.sequence.issue();

        // Local events carry no origin; the dependency stage performs no
        // network fetches, so running it under the lock is safe.
        let prepared = match self
            .dependency_stage(None, event_id, value, room_version, &opts)
            .await
        {
            Ok(prepared) => prepared,
            Err(fault) => {
                self.sequence.abandon(idx);
                return Err(fault);
            }
        };
        let result = self.commit_stage(None, prepared, &opts, idx, false).await;
        drop(guard);
        result
    }

    /// Evaluates one event from its wire form.
    #[tracing::instrument(skip(self, pdu, opts), fields(origin = ?origin))]
    pub async fn eval(
        &self,
        origin: Option<&ServerName>,
        pdu: &RawJsonValue,
        mut opts: EvalOpts,
    ) -> Result<EvalResult, Fault> {
        if let Some(origin) = origin {
            opts.node_id = Some(origin.to_owned());
        }

        let value: CanonicalJsonObject = serde_json::from_str(pdu.get())
            .map_err(|e| hard(Phase::Conform, Error::BadJson(e.to_string())))?;

        let room_version = room_version_of(&value).map_err(|e| hard(Phase::Conform, e))?;

        let (event_id, value) =
            gen_event_id_canonical_json(pdu, &room_version.id, &room_version.rules)
                .map_err(|e| hard(Phase::Conform, e))?;

        // ISSUE: the index is allocated at admission, before any dependency
        // work, so issue order stays FIFO with arrival. Replayed soft events
        // reuse their original index and allocate nothing; a race with a
        // concurrent evaluation of the same event is settled again under
        // the room lock.
        let (idx, replaying) = match services()
            .rooms
            .short
            .get_eventidx(&event_id)
            .map_err(|e| hard(Phase::Issue, e))?
        {
            Some(existing) => {
                if !opts.replays {
                    return Err(hard(
                        Phase::Issue,
                        Error::NotUnique("event already evaluated"),
                    ));
                }
                let soft = services()
                    .rooms
                    .timeline
                    .is_soft_failed(existing)
                    .unwrap_or(false);
                if !soft {
                    return Ok(EvalResult {
                        event_id: Arc::from(&*event_id),
                        idx: existing,
                        soft_failed: false,
                    });
                }
                (existing, true)
            }
            None => (self.sequence.issue(), false),
        };

        // Dependency stage runs unlocked: fetched dependencies re-enter the
        // pipeline and take the room lock themselves.
        let prepared = match self
            .dependency_stage(
                origin,
                Arc::from(&*event_id),
                value,
                room_version,
                &opts,
            )
            .await
        {
            Ok(prepared) => prepared,
            Err(fault) => {
                if !replaying {
                    self.sequence.abandon(idx);
                }
                return Err(fault);
            }
        };

        let room_id = prepared.pdu.room_id.clone();
        let mutex = self.room_mutex(&room_id).await;
        let guard = mutex.lock().await;
        let result = self
            .commit_stage(origin, prepared, &opts, idx, replaying)
            .await;
        drop(guard);
        result
    }

    /// Type-erased form of [`Self::eval`]; the fetch coordinator and the
    /// horizon resubmission re-enter the pipeline through this to keep the
    /// future types finite.
    pub fn eval_boxed<'a>(
        &'a self,
        origin: Option<&'a ServerName>,
        pdu: &'a RawJsonValue,
        opts: EvalOpts,
    ) -> futures_util::future::BoxFuture<'a, Result<EvalResult, Fault>> {
        Box::pin(self.eval(origin, pdu, opts))
    }

    /// Re-evaluates an already written event; used when a horizon gap fills
    /// behind a soft-failed referrer.
    pub async fn resubmit(&self, idx: u64) -> Result<EvalResult, Fault> {
        let json = services()
            .rooms
            .timeline
            .get_pdu_json_by_idx(idx)
            .map_err(|error| Fault::Retry {
                phase: Phase::Issue,
                error,
            })?
            .ok_or_else(|| {
                hard(
                    Phase::Issue,
                    Error::NotFound("resubmitted index has no event"),
                )
            })?;

        let raw = serde_json::value::to_raw_value(&json).expect("stored json serializes");

        let mut opts = EvalOpts::federation();
        opts.replays = true;
        opts.room_head_resolve = true;
        opts.phases = opts.phases.without(Phase::Verify);

        self.eval_boxed(None, &raw, opts).await
    }

    /// ACCESS, VERIFY, FETCH_AUTH, FETCH_PREV and AUTH_STATIC; no room lock.
    async fn dependency_stage(
        &self,
        origin: Option<&ServerName>,
        event_id: Arc<EventId>,
        mut value: CanonicalJsonObject,
        room_version: RoomVersion,
        opts: &EvalOpts,
    ) -> Result<Prepared, Fault> {
        let mut soft = SoftState { failed: false };

        let pdu: Arc<PduEvent> = Arc::new(
            serde_json::from_value(
                serde_json::to_value(&value).expect("CanonicalJsonObject is a valid value"),
            )
            .map_err(|_| {
                hard(
                    Phase::Conform,
                    Error::BadJson("event is not a valid PDU".to_owned()),
                )
            })?,
        );
        let room_id = pdu.room_id.clone();
        let is_create = pdu.kind == ruma::events::TimelineEventType::RoomCreate;

        // ACCESS
        if opts.phases.contains(Phase::Access) {
            self.access(origin, &room_id, is_create)
                .map_err(|e| hard(Phase::Access, e))?;
        }

        // VERIFY
        if opts.phases.contains(Phase::Verify) {
            match services().keys.verify_event(&value, &room_version).await {
                Ok(ruma::signatures::Verified::All) => {}
                Ok(ruma::signatures::Verified::Signatures) => {
                    // Signatures hold but the content hash does not: the
                    // event continues in redacted form.
                    warn!(%event_id, "content hash mismatch; evaluating redacted form");
                    value = ruma::canonical_json::redact(
                        value,
                        &room_version.rules.redaction,
                        None,
                    )
                    .map_err(|e| hard(Phase::Verify, Error::VerifyFail(e.to_string())))?;
                }
                Err(e) => return Err(hard(Phase::Verify, e)),
            }
        }

        // FETCH_AUTH: all auth references must become locally known.
        let mut auth_pdus = Vec::new();
        if opts.phases.contains(Phase::FetchAuth) {
            for auth_id in &pdu.auth_events {
                let mut found = services()
                    .rooms
                    .timeline
                    .get_pdu(auth_id)
                    .map_err(|e| hard(Phase::FetchAuth, e))?;
                if found.is_none() {
                    if let Some(origin) = origin {
                        let _ = services()
                            .fetch
                            .event(&room_id, auth_id, Some(origin))
                            .await;
                        found = services()
                            .rooms
                            .timeline
                            .get_pdu(auth_id)
                            .map_err(|e| hard(Phase::FetchAuth, e))?;
                    }
                }
                match found {
                    Some(found) => auth_pdus.push(found),
                    None => {
                        return Err(hard(
                            Phase::FetchAuth,
                            Error::NotFound("auth event unobtainable"),
                        ))
                    }
                }
            }
        }

        // FETCH_PREV: missing prevs become horizon rows and soft-fail.
        let mut missing_prevs = Vec::new();
        if opts.phases.contains(Phase::FetchPrev) {
            for prev_id in &pdu.prev_events {
                let mut known = services()
                    .rooms
                    .short
                    .get_eventidx(prev_id)
                    .map_err(|e| hard(Phase::FetchPrev, e))?
                    .is_some();
                if !known {
                    if let Some(origin) = origin {
                        let _ = services()
                            .fetch
                            .event(&room_id, prev_id, Some(origin))
                            .await;
                        known = services()
                            .rooms
                            .short
                            .get_eventidx(prev_id)
                            .map_err(|e| hard(Phase::FetchPrev, e))?
                            .is_some();
                    }
                }
                if !known {
                    missing_prevs.push(prev_id.clone());
                }
            }
            if !missing_prevs.is_empty() {
                soften(
                    opts,
                    &mut soft,
                    Phase::FetchPrev,
                    Error::Timeout("prev events unobtainable"),
                )?;
            }
        }

        // AUTH_STATIC: against the event's own auth references.
        if opts.phases.contains(Phase::AuthStatic) {
            let auth = event_auth::AuthSet::new(auth_pdus.clone());
            event_auth::check(&pdu, &room_version, &auth)
                .map_err(|e| hard(Phase::AuthStatic, e))?;
        }

        Ok(Prepared {
            event_id,
            value,
            pdu,
            room_version,
            missing_prevs,
            soft,
        })
    }

    /// FETCH_STATE through RETIRE; caller holds the room lock.
    async fn commit_stage(
        &self,
        origin: Option<&ServerName>,
        prepared: Prepared,
        opts: &EvalOpts,
        mut idx: u64,
        mut replaying: bool,
    ) -> Result<EvalResult, Fault> {
        let Prepared {
            event_id,
            value,
            pdu,
            room_version,
            missing_prevs,
            mut soft,
        } = prepared;

        // Authoritative duplicate re-check now that we are serialized: a
        // concurrent evaluation may have admitted the same event while the
        // dependency stage ran unlocked. Our freshly issued index is then
        // abandoned (a tolerated trailing gap) and theirs adopted.
        let existing = services()
            .rooms
            .short
            .get_eventidx(&event_id)
            .map_err(|e| hard(Phase::Issue, e))?;
        if let Some(existing) = existing {
            if existing != idx {
                if !replaying {
                    self.sequence.abandon(idx);
                }
                if !opts.replays {
                    return Err(hard(
                        Phase::Issue,
                        Error::NotUnique("event already evaluated"),
                    ));
                }
                let still_soft = services()
                    .rooms
                    .timeline
                    .is_soft_failed(existing)
                    .unwrap_or(false);
                if !still_soft {
                    return Ok(EvalResult {
                        event_id,
                        idx: existing,
                        soft_failed: false,
                    });
                }
                idx = existing;
                replaying = true;
            }
        }

        let result = self
            .commit_inner(origin, &event_id, value, &pdu, &room_version, opts, idx, &mut soft, &missing_prevs)
            .await;

        match result {
            Ok(soft_failed) => {
                if !replaying {
                    self.sequence.retire(idx);
                }
                if opts.infolog_accept {
                    info!(%event_id, idx, soft = soft_failed, "event accepted");
                } else if opts.debuglog_accept {
                    debug!(%event_id, idx, soft = soft_failed, "event accepted");
                }
                Ok(EvalResult {
                    event_id,
                    idx,
                    soft_failed,
                })
            }
            Err(fault) => {
                warn!(%event_id, phase = fault.phase().name(), "evaluation faulted");
                if !replaying {
                    self.sequence.abandon(idx);
                }
                Err(fault)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_inner(
        &self,
        _origin: Option<&ServerName>,
        event_id: &Arc<EventId>,
        value: CanonicalJsonObject,
        pdu: &Arc<PduEvent>,
        room_version: &RoomVersion,
        opts: &EvalOpts,
        idx: u64,
        soft: &mut SoftState,
        missing_prevs: &[Arc<EventId>],
    ) -> Result<bool, Fault> {
        let room_id = pdu.room_id.clone();
        let is_create = pdu.kind == ruma::events::TimelineEventType::RoomCreate;

        // FETCH_STATE: the state at the prevs must be computable.
        let mut state_at_prevs: Option<state_res::StateMap> = None;
        if opts.phases.contains(Phase::FetchState) && !is_create {
            if missing_prevs.is_empty() {
                match services()
                    .rooms
                    .state
                    .state_at_prevs(&room_id, &pdu.prev_events)
                {
                    Ok(state) => state_at_prevs = Some(state),
                    Err(e) => soften(opts, soft, Phase::FetchState, e)?,
                }
            } else {
                soften(opts, soft, Phase::FetchState, Error::Incomplete)?;
            }
        }

        // CONFORM
        if opts.phases.contains(Phase::Conform) {
            self.conform(pdu, is_create)
                .map_err(|e| hard(Phase::Conform, e))?;
        }

        // AUTH_RELA: against the current room state.
        if opts.phases.contains(Phase::AuthRela) && !is_create && !soft.failed {
            let selection = services()
                .rooms
                .state
                .auth_events_for(
                    &room_id,
                    &pdu.kind,
                    &pdu.sender,
                    pdu.state_key.as_deref(),
                    &pdu.content,
                )
                .map_err(|e| hard(Phase::AuthRela, e))?;
            let auth = event_auth::AuthSet::new(selection.into_values().collect());
            if let Err(e) = event_auth::check(pdu, room_version, &auth) {
                soften(opts, soft, Phase::AuthRela, e)?;
            }
        }

        // AUTH_PRES: against the state at the event's prevs.
        if opts.phases.contains(Phase::AuthPres) && !is_create {
            if let Some(state) = &state_at_prevs {
                let auth = services()
                    .rooms
                    .state
                    .auth_set_from_map(state, pdu)
                    .map_err(|e| hard(Phase::AuthPres, e))?;
                event_auth::check(pdu, room_version, &auth)
                    .map_err(|e| hard(Phase::AuthPres, e))?;
            }
        }

        let soft_failed = soft.failed;

        // WRITE
        if opts.phases.contains(Phase::Write) {
            let mut prev_refs = Vec::with_capacity(pdu.prev_events.len());
            for prev_id in &pdu.prev_events {
                let prev_idx = services()
                    .rooms
                    .short
                    .get_eventidx(prev_id)
                    .map_err(|e| hard(Phase::Write, e))?;
                prev_refs.push((prev_id.clone(), prev_idx));
            }
            let mut auth_refs = Vec::with_capacity(pdu.auth_events.len());
            for auth_id in &pdu.auth_events {
                let auth_idx = services()
                    .rooms
                    .short
                    .get_eventidx(auth_id)
                    .map_err(|e| hard(Phase::Write, e))?;
                auth_refs.push((auth_id.clone(), auth_idx));
            }

            let prev_state_idx = match pdu.state_key.as_deref() {
                Some(state_key) => services()
                    .rooms
                    .state
                    .room_state_get_idx(&room_id, &pdu.kind.to_string(), state_key)
                    .map_err(|e| hard(Phase::Write, e))?,
                None => None,
            };

            let commit = EventCommit {
                idx,
                pdu: Arc::clone(pdu),
                json: value,
                soft_failed,
                prev_refs,
                auth_refs,
                prev_state_idx,
                apply_state: pdu.is_state() && !soft_failed,
                update_head: opts.room_head && !soft_failed,
            };

            services()
                .rooms
                .timeline
                .append_pdu(&commit)
                .map_err(|e| hard(Phase::Write, e))?;
            self.sequence.commit(idx);
        }

        // NOTIFY
        if opts.phases.contains(Phase::Notify) {
            self.notify(pdu, idx, room_version, opts, soft_failed)
                .await
                .unwrap_or_else(|e| warn!(%event_id, %e, "notify failed"));
        }

        Ok(soft_failed)
    }

    fn access(
        &self,
        origin: Option<&ServerName>,
        room_id: &RoomId,
        is_create: bool,
    ) -> Result<()> {
        let room_exists = services()
            .rooms
            .state
            .room_state_get_idx(room_id, "m.room.create", "")?
            .is_some();

        if is_create {
            if room_exists {
                return Err(Error::NotUnique("room already exists"));
            }
            return Ok(());
        }

        if !room_exists {
            return Err(Error::NotFound("room is unknown to this server"));
        }

        if services().rooms.state.is_disabled(room_id)? {
            return Err(Error::Unavailable(
                "federation of this room is disabled".to_owned(),
            ));
        }

        if let Some(origin) = origin {
            if !services().globals.config.allow_federation {
                return Err(Error::FederationDisabled);
            }
            if !services().rooms.state.server_acl_allows(room_id, origin)? {
                return Err(Error::AuthFail {
                    rule: "server_acl",
                    reason: format!("{origin} is denied by the room's server ACL"),
                });
            }
        }

        Ok(())
    }

    fn conform(&self, pdu: &PduEvent, is_create: bool) -> Result<()> {
        if pdu.hashes.sha256.is_empty() {
            return Err(Error::Conforms("event carries no content hash"));
        }

        if is_create {
            if !pdu.prev_events.is_empty() {
                return Err(Error::Conforms("create event with prev_events"));
            }
            if pdu.depth != UInt::from(0u32) {
                return Err(Error::Conforms("create event with nonzero depth"));
            }
            return Ok(());
        }

        if pdu.prev_events.is_empty() {
            return Err(Error::Conforms(
                "only create events may have no prev_events",
            ));
        }
        if pdu.prev_events.len() > 20 || pdu.auth_events.len() > 10 {
            return Err(Error::Conforms("too many dag references"));
        }

        // Depth discipline is judged only over locally known prevs; gaps
        // defer to the horizon machinery.
        let mut max_known_depth: Option<u64> = None;
        let mut all_known = true;
        for prev_id in &pdu.prev_events {
            match services().rooms.timeline.get_pdu(prev_id)? {
                Some(prev) => {
                    let depth = u64::from(prev.depth);
                    if u64::from(pdu.depth) <= depth {
                        return Err(Error::Conforms("depth does not exceed prev depth"));
                    }
                    max_known_depth =
                        Some(max_known_depth.map_or(depth, |current| current.max(depth)));
                }
                None => all_known = false,
            }
        }
        if all_known {
            if let Some(max_depth) = max_known_depth {
                if u64::from(pdu.depth) > max_depth + 1 {
                    return Err(Error::Conforms("depth exceeds max prev depth plus one"));
                }
            }
        }

        Ok(())
    }

    async fn notify(
        &self,
        pdu: &Arc<PduEvent>,
        idx: u64,
        room_version: &RoomVersion,
        opts: &EvalOpts,
        soft_failed: bool,
    ) -> Result<()> {
        // Horizon release: events that were waiting on this one re-enter
        // the pipeline from their dependency phases.
        let referrers = services().rooms.head.release_horizon(&pdu.event_id)?;
        for referrer in referrers {
            tokio::spawn(async move {
                if let Err(fault) = services().vm.resubmit(referrer).await {
                    warn!(
                        referrer,
                        phase = fault.phase().name(),
                        "horizon resubmission faulted"
                    );
                }
            });
        }

        if soft_failed {
            return Ok(());
        }

        // Forked heads settle through a full recomputation.
        if opts.room_head_resolve
            || (pdu.is_state() && services().rooms.head.heads(&pdu.room_id)?.len() > 1)
        {
            services().rooms.state.recompute(&pdu.room_id)?;
        }

        // Redactions apply to their target on commit.
        if pdu.kind == ruma::events::TimelineEventType::RoomRedaction {
            if let Some(target_id) = &pdu.redacts {
                if services()
                    .rooms
                    .state
                    .user_can_redact(&pdu.room_id, &pdu.sender, target_id)?
                {
                    services()
                        .rooms
                        .timeline
                        .redact_pdu(target_id, pdu, idx, room_version)?;
                }
            }
        }

        if opts.notify_servers {
            services().sending.send_pdu(&pdu.room_id, idx)?;
        }

        Ok(())
    }
}

fn room_id_of(value: &CanonicalJsonObject) -> Result<OwnedRoomId> {
    match value.get("room_id") {
        Some(CanonicalJsonValue::String(room)) => RoomId::parse(room.as_str())
            .map(|r| r.to_owned())
            .map_err(|_| Error::BadJson("invalid room_id in event".to_owned())),
        _ => Err(Error::BadJson("event has no room_id".to_owned())),
    }
}

/// Room version of an event's room; for create events, out of the content.
fn room_version_of(value: &CanonicalJsonObject) -> Result<RoomVersion> {
    let is_create = matches!(
        value.get("type"),
        Some(CanonicalJsonValue::String(kind)) if kind == "m.room.create"
    );

    if is_create {
        let version = match value.get("content") {
            Some(CanonicalJsonValue::Object(content)) => match content.get("room_version") {
                Some(CanonicalJsonValue::String(v)) => RoomVersionId::try_from(v.as_str())
                    .map_err(|_| Error::Conforms("unknown room version in create event"))?,
                None => RoomVersionId::V1,
                _ => return Err(Error::Conforms("room_version is not a string")),
            },
            _ => return Err(Error::BadJson("create event has no content".to_owned())),
        };
        RoomVersion::new(&version)
    } else {
        let room_id = room_id_of(value)?;
        services().rooms.state.room_version(&room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: phase masks compose and the router order is the table order
    #[test]
    fn test_phase_mask_operations() {
        let mask = PhaseMask::EMPTY
            .with(Phase::FetchPrev)
            .with(Phase::AuthRela);
        assert!(mask.contains(Phase::FetchPrev));
        assert!(mask.contains(Phase::AuthRela));
        assert!(!mask.contains(Phase::Verify));

        let narrowed = PhaseMask::ALL.without(Phase::Verify);
        assert!(!narrowed.contains(Phase::Verify));
        assert!(narrowed.contains(Phase::Write));

        assert_eq!(Phase::ALL.len(), 13);
        assert_eq!(Phase::ALL[0], Phase::Issue);
        assert_eq!(Phase::ALL[12], Phase::Retire);
    }

    /// Test: federation defaults soften exactly the causality phases
    #[test]
    fn test_default_nothrows_masks() {
        let federation = EvalOpts::federation();
        assert!(federation.nothrows.contains(Phase::FetchPrev));
        assert!(federation.nothrows.contains(Phase::FetchState));
        assert!(federation.nothrows.contains(Phase::AuthRela));
        assert!(!federation.nothrows.contains(Phase::AuthStatic));

        let local = EvalOpts::local();
        assert_eq!(local.nothrows, PhaseMask::EMPTY);
        assert!(!local.phases.contains(Phase::Verify));
        assert!(local.notify_servers);
    }
}
