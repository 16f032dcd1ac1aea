//! Remote worker peers over HTTP.
//!
//! A remote peer is add-on worker capacity, not a replicated cluster: it
//! exposes one "execute batch" operation at `/execute` accepting the same
//! request body the process workers read from stdin. A peer failure
//! surfaces as captured errors on the items it was handling, never as a
//! crash of the pool.

use crate::engine::wire::{ExecuteRequest, UnitSpec};
use crate::engine::worker::{failure_batch, reply_to_items, Dispatcher};
use crate::engine::RemotePeer;
use crate::item::Item;
use crate::unit::Unit;
use async_trait::async_trait;
use serde_json::Value;

/// Dispatches batches to one remote peer.
pub struct RemoteDispatcher {
    client: reqwest::Client,
    url: String,
}

impl RemoteDispatcher {
    /// Creates a dispatcher for the peer's execute endpoint.
    #[must_use]
    pub fn new(peer: &RemotePeer) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}:{}/execute", peer.host, peer.port()),
        }
    }
}

#[async_trait]
impl Dispatcher for RemoteDispatcher {
    async fn dispatch(
        &mut self,
        unit: &Unit,
        stage: Option<&str>,
        inboxes: Vec<Vec<Value>>,
    ) -> Vec<Item> {
        let count = inboxes.len();
        let spec = match UnitSpec::from_unit(unit) {
            Ok(spec) => spec,
            Err(err) => return failure_batch(count, stage, format!("{err}")),
        };
        let request = ExecuteRequest {
            unit: spec,
            inboxes,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let reply = match response {
            Ok(response) => response.json::<crate::engine::wire::ExecuteReply>().await,
            Err(err) => Err(err),
        };
        match reply {
            Ok(reply) => reply_to_items(reply, stage),
            Err(err) => {
                tracing::warn!(peer = %self.url, error = %err, "remote peer failed");
                failure_batch(count, stage, format!("remote peer {}: {err}", self.url))
            }
        }
    }
}
