// =============================================================================
// Orbiton Matrix Homeserver Core - Peer & Link Pool
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Per-remote connection multiplex: tag and byte accounting, saturation
//   backpressure, error latching and destination resolution. Peers latch on
//   transport failures, timeouts included, so a cleared peer whose next
//   request times out re-latches. A latched peer is skipped by fan-out
//   enumeration until an operator clears it; there is no automatic
//   un-latch. Outbound requests carry X-Matrix signatures over the
//   canonical request form.
//
// =============================================================================

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use http::Method;
use ruma::{CanonicalJsonValue, OwnedServerName, ServerName};
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::{services, Error, Result};

/// How a peer's links are shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// Abortive close.
    Rst,
    /// Orderly TLS close-notify drain.
    SslNotify,
}

/// Live accounting of one remote server.
#[derive(Default)]
pub struct PeerCounters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub tags_queued: AtomicU64,
    pub tags_done: AtomicU64,
    pub links: AtomicU64,
}

/// Snapshot of a peer's counters for operator surfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tags_queued: u64,
    pub tags_done: u64,
    pub links: u64,
    pub failure_streak: u64,
    pub latched: bool,
}

pub struct Peer {
    pub server_name: OwnedServerName,
    pub counters: PeerCounters,
    /// Latched error; set on hard failures, cleared only by an operator.
    err: StdMutex<Option<String>>,
    /// Link saturation gate; submitters wait when all tags are committed.
    links: Arc<Semaphore>,
    /// Bumped by cancel(); results from an older epoch are discarded.
    epoch: AtomicU64,
    failure_streak: AtomicU64,
}

impl Peer {
    fn new(server_name: OwnedServerName, link_capacity: usize) -> Self {
        Self {
            server_name,
            counters: PeerCounters::default(),
            err: StdMutex::new(None),
            links: Arc::new(Semaphore::new(link_capacity)),
            epoch: AtomicU64::new(0),
            failure_streak: AtomicU64::new(0),
        }
    }

    pub fn err_has(&self) -> bool {
        self.err.lock().expect("lock is not poisoned").is_some()
    }

    pub fn err_msg(&self) -> Option<String> {
        self.err.lock().expect("lock is not poisoned").clone()
    }

    fn latch(&self, message: String) {
        warn!(peer = %self.server_name, %message, "peer latched in error");
        *self.err.lock().expect("lock is not poisoned") = Some(message);
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            tags_queued: self.counters.tags_queued.load(Ordering::Relaxed),
            tags_done: self.counters.tags_done.load(Ordering::Relaxed),
            links: self.counters.links.load(Ordering::Relaxed),
            failure_streak: self.failure_streak.load(Ordering::Relaxed),
            latched: self.err_has(),
        }
    }
}

pub struct Service {
    peers: RwLock<HashMap<OwnedServerName, Arc<Peer>>>,
    /// Resolved base URLs from well-known discovery.
    destinations: RwLock<HashMap<OwnedServerName, String>>,
}

impl Service {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            destinations: RwLock::new(HashMap::new()),
        }
    }

    pub async fn peer(&self, server: &ServerName) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().await.get(server) {
            return Arc::clone(peer);
        }
        let link_capacity = services().globals.config.peer_link_capacity;
        Arc::clone(
            self.peers
                .write()
                .await
                .entry(server.to_owned())
                .or_insert_with(|| Arc::new(Peer::new(server.to_owned(), link_capacity))),
        )
    }

    pub async fn is_latched(&self, server: &ServerName) -> bool {
        match self.peers.read().await.get(server) {
            Some(peer) => peer.err_has(),
            None => false,
        }
    }

    /// Operator action; the only way a latched peer returns to rotation.
    pub async fn err_clear(&self, server: &ServerName) {
        if let Some(peer) = self.peers.read().await.get(server) {
            info!(peer = %server, "peer error cleared");
            *peer.err.lock().expect("lock is not poisoned") = None;
            peer.failure_streak.store(0, Ordering::Relaxed);
        }
    }

    pub async fn failure_streak(&self, server: &ServerName) -> u64 {
        match self.peers.read().await.get(server) {
            Some(peer) => peer.failure_streak.load(Ordering::Relaxed),
            None => 0,
        }
    }

    pub async fn snapshot(&self, server: &ServerName) -> Option<PeerSnapshot> {
        self.peers.read().await.get(server).map(|p| p.snapshot())
    }

    /// Drains or aborts a peer's links; the peer itself stays known.
    pub async fn close(&self, server: &ServerName, mode: CloseMode) {
        let peer = self.peer(server).await;
        peer.epoch.fetch_add(1, Ordering::SeqCst);
        peer.counters.links.store(0, Ordering::Relaxed);
        debug!(peer = %server, ?mode, "peer closed");
        if mode == CloseMode::Rst {
            peer.latch("closed by operator".to_owned());
        }
    }

    /// Aborts in-flight tags: their results are discarded on completion.
    pub async fn cancel(&self, server: &ServerName) {
        let peer = self.peer(server).await;
        let epoch = peer.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(peer = %server, epoch, "in-flight tags canceled");
    }

    /// One signed federation request to a peer. Accounts tags and bytes,
    /// latches on hard transport errors, and honors cancellation epochs.
    #[tracing::instrument(skip(self, body), fields(dest = %dest, path))]
    pub async fn request(
        &self,
        dest: &ServerName,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let peer = self.peer(dest).await;

        if let Some(message) = peer.err_msg() {
            return Err(Error::Unavailable(format!("{dest} is latched: {message}")));
        }

        peer.counters.tags_queued.fetch_add(1, Ordering::Relaxed);
        let epoch = peer.epoch.load(Ordering::SeqCst);

        // Backpressure: saturated links queue submitters; one that cannot
        // get a slot inside the deadline counts as a timeout.
        let permit = tokio::time::timeout(timeout, Arc::clone(&peer.links).acquire_owned())
            .await
            .map_err(|_| Error::Timeout("peer links saturated"))?
            .map_err(|_| Error::Unavailable(format!("{dest} link pool closed")))?;
        peer.counters.links.fetch_add(1, Ordering::Relaxed);

        let result = self
            .request_inner(&peer, dest, method, path, body, timeout)
            .await;

        peer.counters.links.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        if peer.epoch.load(Ordering::SeqCst) != epoch {
            return Err(Error::Unavailable(format!("{dest} request canceled")));
        }

        match &result {
            Ok(_) => {
                peer.counters.tags_done.fetch_add(1, Ordering::Relaxed);
                peer.failure_streak.store(0, Ordering::Relaxed);
            }
            Err(_) => {
                peer.failure_streak.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    async fn request_inner(
        &self,
        peer: &Peer,
        dest: &ServerName,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let base = self.resolve(dest).await?;
        let url = format!("{base}{path}");

        let authorization = self.sign_request(dest, method.as_str(), path, body.as_ref())?;

        let client = services().globals.federation_client();
        let mut request = client
            .request(
                reqwest::Method::from_bytes(method.as_str().as_bytes())
                    .expect("http methods round-trip"),
                &url,
            )
            .header("Authorization", authorization)
            .timeout(timeout);

        if let Some(body) = &body {
            let bytes = serde_json::to_vec(body).expect("json body serializes");
            peer.counters
                .bytes_out
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            request = request
                .header("Content-Type", "application/json")
                .body(bytes);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                // A timed-out peer latches like an unreachable one; a peer
                // whose error was cleared re-latches on its next timeout.
                peer.latch(format!("timeout: {e}"));
                Error::Timeout("federation request timed out")
            } else if e.is_connect() {
                peer.latch(format!("connect: {e}"));
                Error::Unavailable(format!("{dest} unreachable: {e}"))
            } else {
                Error::Unavailable(format!("{dest} request failed: {e}"))
            }
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Unavailable(format!("{dest} body read failed: {e}")))?;
        peer.counters
            .bytes_in
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let value: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|_| Error::BadServerResponse(dest.to_owned(), "response is not json"))?;

        if !status.is_success() {
            let errcode = value
                .get("errcode")
                .and_then(|e| e.as_str())
                .unwrap_or("M_UNKNOWN");
            return Err(Error::Unavailable(format!(
                "{dest} answered {status}: {errcode}"
            )));
        }

        Ok(value)
    }

    /// Well-known delegation with cache; port 8448 fallback.
    async fn resolve(&self, dest: &ServerName) -> Result<String> {
        if let Some(base) = self.destinations.read().await.get(dest) {
            return Ok(base.clone());
        }

        let resolved = if dest.port().is_some() {
            format!("https://{dest}")
        } else {
            match self.well_known(dest).await {
                Some(delegated) => {
                    debug!(%dest, %delegated, "well-known delegation");
                    if delegated.contains(':') {
                        format!("https://{delegated}")
                    } else {
                        format!("https://{delegated}:8448")
                    }
                }
                None => format!("https://{dest}:8448"),
            }
        };

        self.destinations
            .write()
            .await
            .insert(dest.to_owned(), resolved.clone());
        Ok(resolved)
    }

    async fn well_known(&self, dest: &ServerName) -> Option<String> {
        let response = services()
            .globals
            .federation_client()
            .get(format!("https://{dest}/.well-known/matrix/server"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        let body: JsonValue = response.json().await.ok()?;
        Some(body.get("m.server")?.as_str()?.to_owned())
    }

    /// X-Matrix authorization over the canonical request form.
    fn sign_request(
        &self,
        dest: &ServerName,
        method: &str,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<String> {
        let origin = services().globals.server_name();

        let mut request_map = ruma::CanonicalJsonObject::new();
        request_map.insert("method".to_owned(), CanonicalJsonValue::String(method.to_owned()));
        request_map.insert("uri".to_owned(), CanonicalJsonValue::String(path.to_owned()));
        request_map.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(origin.as_str().to_owned()),
        );
        request_map.insert(
            "destination".to_owned(),
            CanonicalJsonValue::String(dest.as_str().to_owned()),
        );
        if let Some(body) = body {
            request_map.insert(
                "content".to_owned(),
                CanonicalJsonValue::try_from(body.clone())
                    .map_err(|e| Error::BadJson(e.to_string()))?,
            );
        }

        ruma::signatures::sign_json(
            origin.as_str(),
            services().globals.keypair(),
            &mut request_map,
        )
        .map_err(|e| Error::Internal(format!("signing request failed: {e}")))?;

        let signatures = request_map
            .get("signatures")
            .and_then(|v| match v {
                CanonicalJsonValue::Object(o) => o.get(origin.as_str()),
                _ => None,
            })
            .and_then(|v| match v {
                CanonicalJsonValue::Object(o) => Some(o),
                _ => None,
            })
            .ok_or_else(|| Error::Internal("request signature missing".to_owned()))?;

        let (key_id, signature) = signatures
            .iter()
            .next()
            .ok_or_else(|| Error::Internal("request signature empty".to_owned()))?;
        let signature = match signature {
            CanonicalJsonValue::String(s) => s.clone(),
            _ => return Err(Error::Internal("request signature malformed".to_owned())),
        };

        Ok(format!(
            "X-Matrix origin=\"{origin}\",destination=\"{dest}\",key=\"{key_id}\",sig=\"{signature}\""
        ))
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    /// Test: peers latch on error, disappear from rotation, and return only
    /// through err_clear
    #[tokio::test]
    async fn test_latch_and_clear() {
        let services = test_utils::init_services().await;
        let server: &ServerName = "unreachable.example".try_into().unwrap();

        let peer = services.peers.peer(server).await;
        assert!(!peer.err_has());
        peer.latch("connection refused".to_owned());

        assert!(services.peers.is_latched(server).await);
        let err = services
            .peers
            .request(
                server,
                Method::GET,
                "/_matrix/federation/v1/version",
                None,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));

        services.peers.err_clear(server).await;
        assert!(!services.peers.is_latched(server).await);
    }

    /// Test: cancel bumps the epoch so stale results are discarded
    #[tokio::test]
    async fn test_cancel_epoch() {
        let services = test_utils::init_services().await;
        let server: &ServerName = "cancel.example".try_into().unwrap();

        let peer = services.peers.peer(server).await;
        let before = peer.epoch.load(Ordering::SeqCst);
        services.peers.cancel(server).await;
        assert_eq!(peer.epoch.load(Ordering::SeqCst), before + 1);
    }

    /// Test: counter snapshot starts clean
    #[tokio::test]
    async fn test_snapshot_defaults() {
        let services = test_utils::init_services().await;
        let server: &ServerName = "fresh.example".try_into().unwrap();
        services.peers.peer(server).await;

        let snapshot = services.peers.snapshot(server).await.unwrap();
        assert_eq!(snapshot.tags_queued, 0);
        assert_eq!(snapshot.failure_streak, 0);
        assert!(!snapshot.latched);
    }
}
