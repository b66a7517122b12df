use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{instrument, warn};

use crate::{
    contact::{Contact, SenderEnvelope},
    routing::{InsertOutcome, RoutingTable},
    rpc::{FoundContact, Request, Response, TransportSender},
    storage::ValueStore,
};

/// The [`Contact`] a request should be routed under: the sender's claimed id
/// and port, but the address the transport actually observed it from, never
/// the self-reported one in the envelope. Prevents spoofed address
/// registration (§4.G, §7).
pub fn observed_contact(source_host: IpAddr, envelope: SenderEnvelope) -> Contact {
    Contact::new(envelope.id, source_host, envelope.port)
}

/// Registers an observed contact, running the stale-eviction protocol if its
/// covering bucket is full and does not split: if the current head hasn't
/// been seen in longer than `max_ping_interval`, it is probed with a `PING`;
/// otherwise the candidate is simply buffered (already done by
/// `RoutingTable::insert`) and nobody is probed (§4.G, S5).
///
/// Three probe outcomes (§5, §7):
/// - the head answers with its own id: it's alive, moved to the tail, and
///   the candidate is dropped.
/// - the head times out or the probe transport-errors: genuinely
///   unresponsive, the candidate displaces it.
/// - the head answers but with a different id, or an unexpected reply shape:
///   inconclusive — something's wrong at that address, but not provably dead
///   either — so neither the head nor the candidate is touched.
///
/// This probe can take up to `rpc_timeout` to resolve; `on_request` spawns it
/// detached rather than awaiting it inline, so it runs concurrently with
/// other traffic and never delays the reply to the inbound RPC that
/// triggered it (§4.G).
#[instrument(skip(sender, routing, self_envelope), fields(candidate = ?candidate.id()))]
pub async fn register_contact<T: TransportSender>(
    sender: T,
    self_envelope: SenderEnvelope,
    routing: Arc<Mutex<RoutingTable>>,
    rpc_timeout: Duration,
    max_ping_interval: Duration,
    candidate: Contact,
) {
    let outcome = routing.lock().unwrap().insert(candidate.clone());
    let stale_head = match outcome {
        InsertOutcome::Stale(head) => head,
        _ => return,
    };

    if stale_head.last_seen().elapsed() < max_ping_interval {
        return;
    }

    let probe = sender.send(&stale_head, Request::Ping(self_envelope));
    match tokio::time::timeout(rpc_timeout, probe).await {
        Ok(Ok(Response::Pong(envelope))) if envelope.id == stale_head.id() => {
            let mut alive = stale_head;
            alive.touch();
            routing.lock().unwrap().insert(alive);
        }
        Ok(Ok(_)) => {
            warn!("stale-eviction probe got a mismatched or unexpected reply, leaving the bucket untouched");
        }
        Ok(Err(_)) | Err(_) => {
            let replaced = routing
                .lock()
                .unwrap()
                .replace_stale_head(stale_head.id(), candidate);
            if !replaced {
                warn!("stale bucket head vanished before eviction could complete");
            }
        }
    }
}

/// Handles one inbound request (§4.G): kicks off sender registration, then
/// answers according to the request's operation without waiting for that
/// registration to settle. Every RPC, inbound or outbound, is a liveness
/// signal, but the stale-eviction probe it can trigger must not hold up the
/// reply — it is spawned detached and left to resolve on its own schedule.
#[instrument(skip(sender, routing, store, request), fields(source = %source_host))]
pub async fn on_request<T: TransportSender, V: ValueStore + ?Sized>(
    self_envelope: SenderEnvelope,
    sender: &T,
    routing: &Arc<Mutex<RoutingTable>>,
    store: &Mutex<V>,
    rpc_timeout: Duration,
    max_ping_interval: Duration,
    source_host: IpAddr,
    request: Request,
) -> Response {
    let candidate = observed_contact(source_host, request.sender());
    tokio::spawn(register_contact(
        sender.clone(),
        self_envelope,
        Arc::clone(routing),
        rpc_timeout,
        max_ping_interval,
        candidate,
    ));

    match request {
        Request::Ping(_) => Response::Pong(self_envelope),

        Request::FindNode(target, _) => {
            let k = routing.lock().unwrap().bucket_size();
            let closest = routing.lock().unwrap().find_closest(target, k);
            Response::FoundNodes(closest.iter().map(FoundContact::from).collect(), self_envelope)
        }

        Request::FindValue(key, _) => {
            let found = store.lock().unwrap().get(&key);
            match found {
                Some(value) => Response::FoundValue(value, self_envelope),
                None => {
                    let k = routing.lock().unwrap().bucket_size();
                    let closest = routing.lock().unwrap().find_closest(key, k);
                    Response::FoundNodes(
                        closest.iter().map(FoundContact::from).collect(),
                        self_envelope,
                    )
                }
            }
        }

        Request::Store(key, value, _) => match store.lock().unwrap().put(key, value) {
            Ok(_) => Response::Stored(self_envelope),
            Err(err) => {
                warn!(%err, "rejected STORE");
                Response::Error
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};
    use std::pin::Pin;

    use crate::config::RoutingConfig;
    use crate::id::Id;
    use crate::rpc::TransportError;

    use super::*;

    #[derive(Clone)]
    enum MockBehavior {
        Pong(Id),
        Timeout,
        TransportError,
    }

    #[derive(Clone)]
    struct MockSender(MockBehavior);

    impl TransportSender for MockSender {
        type Fut = Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send>>;

        fn send(&self, _to: &Contact, _request: Request) -> Self::Fut {
            let behavior = self.0.clone();
            Box::pin(async move {
                match behavior {
                    MockBehavior::Pong(id) => Ok(Response::Pong(SenderEnvelope::new(id, 1))),
                    MockBehavior::Timeout => {
                        futures::future::pending::<()>().await;
                        unreachable!()
                    }
                    MockBehavior::TransportError => {
                        Err(TransportError::Transport("simulated failure".into()))
                    }
                }
            })
        }
    }

    fn contact(id: Id) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 1234)
    }

    /// A table with a single far-side bucket already at capacity, so the
    /// next insert is guaranteed to report `Stale`.
    fn full_table() -> (RoutingTable, Id) {
        let owner = Id::ZERO;
        let mut config = RoutingConfig::default();
        config.bucket_size = 1;
        let mut table = RoutingTable::new(owner, config);
        let head_id = Id::from_hex("80");
        table.insert(contact(head_id));
        (table, head_id)
    }

    #[tokio::test]
    async fn stale_eviction_replaces_an_unresponsive_head() {
        let (table, head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let sender = MockSender(MockBehavior::Timeout);
        let candidate = contact(Id::from_hex("90"));

        register_contact(
            sender.clone(),
            SenderEnvelope::new(Id::from_hex("ff"), 1),
            Arc::clone(&routing),
            Duration::from_millis(10),
            Duration::ZERO,
            candidate.clone(),
        )
        .await;

        let table = Arc::try_unwrap(routing).unwrap().into_inner().unwrap();
        assert!(!table.contains(head_id));
        assert!(table.contains(candidate.id()));
    }

    #[tokio::test]
    async fn transport_error_also_evicts_the_head() {
        let (table, head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let sender = MockSender(MockBehavior::TransportError);
        let candidate = contact(Id::from_hex("90"));

        register_contact(
            sender.clone(),
            SenderEnvelope::new(Id::from_hex("ff"), 1),
            Arc::clone(&routing),
            Duration::from_millis(50),
            Duration::ZERO,
            candidate.clone(),
        )
        .await;

        let table = Arc::try_unwrap(routing).unwrap().into_inner().unwrap();
        assert!(!table.contains(head_id));
        assert!(table.contains(candidate.id()));
    }

    #[tokio::test]
    async fn live_head_survives_and_candidate_is_dropped() {
        let (table, head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let sender = MockSender(MockBehavior::Pong(head_id));
        let candidate = contact(Id::from_hex("90"));

        register_contact(
            sender.clone(),
            SenderEnvelope::new(Id::from_hex("ff"), 1),
            Arc::clone(&routing),
            Duration::from_millis(50),
            Duration::ZERO,
            candidate.clone(),
        )
        .await;

        let table = Arc::try_unwrap(routing).unwrap().into_inner().unwrap();
        assert!(table.contains(head_id));
        assert!(!table.contains(candidate.id()));
    }

    #[tokio::test]
    async fn identity_mismatch_leaves_both_untouched() {
        let (table, head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let wrong_id = Id::from_hex("aa");
        let sender = MockSender(MockBehavior::Pong(wrong_id));
        let candidate = contact(Id::from_hex("90"));

        register_contact(
            sender.clone(),
            SenderEnvelope::new(Id::from_hex("ff"), 1),
            Arc::clone(&routing),
            Duration::from_millis(50),
            Duration::ZERO,
            candidate.clone(),
        )
        .await;

        let table = Arc::try_unwrap(routing).unwrap().into_inner().unwrap();
        assert!(table.contains(head_id));
        assert!(!table.contains(candidate.id()));
    }

    #[tokio::test]
    async fn young_head_is_never_probed() {
        let (table, head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let sender = MockSender(MockBehavior::Timeout);
        let candidate = contact(Id::from_hex("90"));

        register_contact(
            sender.clone(),
            SenderEnvelope::new(Id::from_hex("ff"), 1),
            Arc::clone(&routing),
            Duration::from_millis(10),
            Duration::from_secs(900),
            candidate.clone(),
        )
        .await;

        let table = Arc::try_unwrap(routing).unwrap().into_inner().unwrap();
        assert!(table.contains(head_id));
        assert!(!table.contains(candidate.id()));
    }

    /// `on_request` itself must never block on the stale-eviction probe: the
    /// reply to the inbound RPC that triggered registration comes back even
    /// while a slow probe is still in flight (§4.G).
    #[tokio::test]
    async fn on_request_replies_without_waiting_for_the_stale_eviction_probe() {
        let (table, _head_id) = full_table();
        let routing = Arc::new(Mutex::new(table));
        let store: Mutex<crate::storage::InMemoryValueStore> =
            Mutex::new(crate::storage::InMemoryValueStore::new(Default::default()));
        let sender = MockSender(MockBehavior::Timeout);
        let candidate_envelope = SenderEnvelope::new(Id::from_hex("90"), 1234);

        let response = tokio::time::timeout(
            Duration::from_millis(20),
            on_request(
                SenderEnvelope::new(Id::from_hex("ff"), 1),
                &sender,
                &routing,
                &store,
                Duration::from_secs(5),
                Duration::ZERO,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                Request::Ping(candidate_envelope),
            ),
        )
        .await
        .expect("on_request should reply immediately, not after the probe settles");

        assert!(matches!(response, Response::Pong(_)));
    }
}
