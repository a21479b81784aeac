// =============================================================================
// Orbiton Matrix Homeserver Core - Federation Sender
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound delivery of locally committed events. Destinations are the
//   room's current origins; events batch into transactions whose ids are
//   stable across retries so receivers can deduplicate. Failures count
//   against the peer pool and retry with exponential backoff.
//
// =============================================================================

use std::{collections::BTreeMap, time::Duration};

use http::Method;
use ruma::{OwnedServerName, RoomId};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{services, utils, Error, Result};

const RETRY_LIMIT: u32 = 4;

pub struct Service {
    outgoing: mpsc::UnboundedSender<(OwnedServerName, u64)>,
    receiver: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(OwnedServerName, u64)>>>,
}

impl Service {
    pub fn build() -> Self {
        let (outgoing, receiver) = mpsc::unbounded_channel();
        Self {
            outgoing,
            receiver: std::sync::Mutex::new(Some(receiver)),
        }
    }

    /// Spawns the delivery worker; called once after services are up.
    pub fn start(&self) {
        let Some(mut receiver) = self
            .receiver
            .lock()
            .expect("lock is not poisoned")
            .take()
        else {
            return;
        };

        tokio::spawn(async move {
            info!("🚚 Federation sender running");
            while let Some((destination, idx)) = receiver.recv().await {
                // Drain whatever queued up for the same destination so one
                // transaction carries the batch.
                let mut batch = vec![idx];
                let mut requeue = Vec::new();
                while let Ok((other_dest, other_idx)) = receiver.try_recv() {
                    if other_dest == destination && batch.len() < 50 {
                        batch.push(other_idx);
                    } else {
                        requeue.push((other_dest, other_idx));
                    }
                }
                for entry in requeue {
                    let _ = services().sending.outgoing.send(entry);
                }

                if let Err(e) = deliver(&destination, &batch).await {
                    warn!(%destination, %e, "transaction undeliverable");
                }
            }
        });
    }

    /// NOTIFY entry: queues a committed event for every remote origin of
    /// its room.
    #[tracing::instrument(skip(self))]
    pub fn send_pdu(&self, room_id: &RoomId, idx: u64) -> Result<()> {
        let origins = services().rooms.state.room_servers(room_id)?;
        for origin in origins {
            if origin == services().globals.server_name() {
                continue;
            }
            self.outgoing
                .send((origin, idx))
                .map_err(|_| Error::Internal("federation sender is gone".to_owned()))?;
        }
        Ok(())
    }
}

/// Sends one transaction, retrying with backoff under a stable txn id.
async fn deliver(destination: &OwnedServerName, idxs: &[u64]) -> Result<()> {
    let mut pdus = Vec::with_capacity(idxs.len());
    for idx in idxs {
        if let Some(json) = services().rooms.timeline.get_pdu_json_by_idx(*idx)? {
            pdus.push(serde_json::to_value(&json).expect("stored json serializes"));
        }
    }
    if pdus.is_empty() {
        return Ok(());
    }

    // The txn id survives retries; the receiver's dedup makes redelivery
    // indistinguishable from a single delivery.
    let txn_id = utils::random_string(16);
    let body = json!({
        "origin": services().globals.server_name().as_str(),
        "origin_server_ts": utils::millis_since_unix_epoch(),
        "pdus": pdus,
    });

    let timeout = Duration::from_secs(services().globals.config.federation_timeout_s);
    let mut backoff = Duration::from_secs(5);

    for attempt in 0..RETRY_LIMIT {
        match services()
            .peers
            .request(
                destination,
                Method::PUT,
                &format!("/_matrix/federation/v1/send/{txn_id}"),
                Some(body.clone()),
                timeout,
            )
            .await
        {
            Ok(response) => {
                let rejected: BTreeMap<String, serde_json::Value> = response
                    .get("pdus")
                    .and_then(|p| p.as_object())
                    .map(|map| {
                        map.iter()
                            .filter(|(_, result)| result.get("error").is_some())
                            .map(|(id, result)| (id.clone(), result.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                if !rejected.is_empty() {
                    warn!(%destination, ?rejected, "peer rejected pdus in transaction");
                }
                debug!(%destination, txn_id, pdus = idxs.len(), "transaction delivered");
                return Ok(());
            }
            Err(Error::Unavailable(message)) if attempt + 1 == RETRY_LIMIT => {
                return Err(Error::Unavailable(message));
            }
            Err(e) => {
                debug!(%destination, attempt, %e, "transaction attempt failed");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }

    Err(Error::Timeout("transaction retries exhausted"))
}
