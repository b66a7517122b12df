use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use tracing::{instrument, warn};

use crate::{
    config::SystemConfig,
    contact::{Contact, SenderEnvelope},
    dispatch,
    id::{Id, IdRange},
    routing::RoutingTable,
    rpc::{Request, Response, TransportError, TransportListener, TransportSender},
    search::{self, LookupKind, LookupOutcome},
    storage::{StorageError, ValueStore},
};

/// The node facade: owns one identity, one routing table and one value
/// store, and exposes the operations a user of the network actually calls
/// (find a node, find a value, store a value, join the network) on top of
/// the lower-level routing/lookup/dispatch machinery.
pub struct KademliaDht<T: TransportSender> {
    id: Id,
    port: u16,
    config: SystemConfig,
    transport: T,
    /// Shared so the stale-eviction probe `dispatch::on_request` spawns
    /// detached (§4.G) can outlive the inbound call that triggered it.
    routing: Arc<Mutex<RoutingTable>>,
    store: Mutex<Box<dyn ValueStore>>,
}

impl<T: TransportSender> KademliaDht<T> {
    pub fn new<V: ValueStore + 'static>(
        config: SystemConfig,
        id: Id,
        port: u16,
        transport: T,
        store: V,
    ) -> Self {
        KademliaDht {
            id,
            port,
            routing: Arc::new(Mutex::new(RoutingTable::new(id, config.routing.clone()))),
            store: Mutex::new(Box::new(store)),
            config,
            transport,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of contacts currently routed, across all buckets.
    pub fn routing_table_len(&self) -> usize {
        self.routing.lock().unwrap().len()
    }

    fn self_envelope(&self) -> SenderEnvelope {
        SenderEnvelope::new(self.id, self.port)
    }

    fn closest_known(&self, target: Id) -> Vec<Contact> {
        self.routing
            .lock()
            .unwrap()
            .find_closest(target, self.config.routing.bucket_size)
    }

    /// Locates the `bucket_size` nodes closest to `target` known anywhere on
    /// the network, iteratively querying outward from the locally closest
    /// known contacts (§4.H).
    #[instrument(skip(self))]
    pub async fn find_node(&self, target: Id) -> Vec<Contact> {
        let shortlist = self.closest_known(target);
        match search::run(
            target,
            LookupKind::Nodes,
            shortlist,
            self.id,
            &self.transport,
            self.self_envelope(),
            &self.routing,
            &self.config.routing,
        )
        .await
        {
            LookupOutcome::Nodes(nodes) => nodes,
            LookupOutcome::Value(_) => unreachable!("a node lookup cannot yield a value"),
        }
    }

    /// Looks up `key`'s value: first locally, then by iterative lookup
    /// across the network (§4.H, the FIND_VALUE discriminated union).
    #[instrument(skip(self))]
    pub async fn find_value(&self, key: Id) -> Option<Vec<u8>> {
        if let Some(value) = self.store.lock().unwrap().get(&key) {
            return Some(value);
        }

        let shortlist = self.closest_known(key);
        match search::run(
            key,
            LookupKind::Value,
            shortlist,
            self.id,
            &self.transport,
            self.self_envelope(),
            &self.routing,
            &self.config.routing,
        )
        .await
        {
            LookupOutcome::Value(value) => Some(value),
            LookupOutcome::Nodes(_) => None,
        }
    }

    /// Publishes `value` under `key`: finds the `bucket_size` nodes closest
    /// to `key` (replicating locally too, if this node is among them) and
    /// fires a STORE at each of them. Per §4.H there is no consensus and no
    /// ack aggregation — this returns as soon as the FIND_NODE completes,
    /// without waiting for any of the STOREs to be acknowledged. The STOREs
    /// themselves run to completion in the background; failures are only
    /// logged, since a lookup-level caller has no way to act on them anyway.
    /// The returned count is the number of nodes the value was dispatched
    /// to, not a count of confirmed writes.
    #[instrument(skip(self, value))]
    pub async fn store(&self, key: Id, value: Vec<u8>) -> Result<usize, StorageError> {
        if value.len() > self.config.storage.max_value_size {
            return Err(StorageError::ValueTooLarge);
        }

        let nodes = self.find_node(key).await;
        let mut dispatched = 0usize;

        if self_is_among_closest(self.id, key, &nodes, self.config.routing.bucket_size) {
            match self.store.lock().unwrap().put(key, value.clone()) {
                Ok(_) => dispatched += 1,
                Err(err) => warn!(%err, "local replica rejected"),
            }
        }

        for to in nodes.into_iter().filter(|c| c.id() != self.id) {
            let transport = self.transport.clone();
            let request = Request::Store(key, value.clone(), self.self_envelope());
            dispatched += 1;
            tokio::spawn(async move {
                match transport.send(&to, request).await {
                    Ok(Response::Stored(_)) => {}
                    Ok(_) => warn!("node returned an unexpected reply to STORE"),
                    Err(err) => warn!(%err, "STORE rpc failed"),
                }
            });
        }

        Ok(dispatched)
    }

    /// Pings `contact` and, only once it answers with the id it claims to
    /// have, routes it. This is how a brand new contact — one this node has
    /// never exchanged any other RPC with — is safely admitted (§4.F, §5):
    /// admitting an unverified id/address pairing would let a single lying
    /// peer plant arbitrary entries.
    #[instrument(skip(self))]
    pub async fn add_contact(&self, contact: Contact) -> Result<(), TransportError> {
        let reply = tokio::time::timeout(
            self.config.routing.rpc_timeout,
            self.transport.send(&contact, Request::Ping(self.self_envelope())),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        match reply {
            Response::Pong(envelope) if envelope.id == contact.id() => {
                self.routing.lock().unwrap().insert(contact);
                Ok(())
            }
            Response::Pong(_) => Err(TransportError::Transport(
                "ping reply id did not match the contact dialed".into(),
            )),
            _ => Err(TransportError::Transport("unexpected reply to PING".into())),
        }
    }

    /// Pings a peer at `addr` whose id isn't known yet — the normal way a
    /// node is first introduced to the network, via an address read off a
    /// config file or command line rather than discovered through a prior
    /// RPC. Routes it under whatever id the PONG claims.
    #[instrument(skip(self))]
    pub async fn join(&self, addr: std::net::SocketAddr) -> Result<Contact, TransportError> {
        let placeholder = Contact::new(Id::ZERO, addr.ip(), addr.port());
        let reply = tokio::time::timeout(
            self.config.routing.rpc_timeout,
            self.transport
                .send(&placeholder, Request::Ping(self.self_envelope())),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        match reply {
            Response::Pong(envelope) => {
                let contact = Contact::new(envelope.id, addr.ip(), addr.port());
                self.routing.lock().unwrap().insert(contact.clone());
                Ok(contact)
            }
            _ => Err(TransportError::Transport("unexpected reply to PING".into())),
        }
    }

    /// Joins the network through `seed`: pings and routes it, finds this
    /// node's own neighbourhood, then walks back up the shared prefix with
    /// the closest sibling found, firing one FIND_NODE per bit position to
    /// populate every bucket along the way. Ported from the reference
    /// implementation's join sequence, generalized to the dynamic bucket
    /// layout.
    #[instrument(skip(self, rng))]
    pub async fn bootstrap<R: Rng>(&self, seed: std::net::SocketAddr, rng: &mut R) {
        if let Err(err) = self.join(seed).await {
            warn!(%err, "bootstrap seed did not answer the initial ping");
            return;
        }

        let nodes = self.find_node(self.id).await;
        let closest_sibling = match nodes.iter().find(|c| c.id() != self.id) {
            None => return, // We are the only node in the network so far.
            Some(c) => c,
        };

        let shared_prefix_len = (self.id ^ closest_sibling.id()).leading_zeros() as usize;

        let mut refreshes: FuturesUnordered<_> = (0..shared_prefix_len)
            .rev()
            .map(|bit| {
                // The bucket at this depth covers ids sharing `bit` leading
                // bits with us and diverging at bit `bit`; sample a random id
                // from inside it to reveal whoever lives there.
                let sibling_prefix = flip_bit(self.id, bit);
                IdRange::with_prefix(sibling_prefix, bit + 1).sample_uniform(rng)
            })
            .map(|target| self.find_node(target))
            .collect();

        while refreshes.next().await.is_some() {}
    }

    /// Runs one maintenance pass: refreshes every bucket that hasn't been
    /// consulted in longer than `refresh_interval` by issuing a FIND_NODE for
    /// a random id inside it (§4.I). Non-blocking in the sense that it does
    /// not itself schedule repetition — an owning binary drives the cadence
    /// (e.g. with a `tokio::time::interval`).
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) {
        let targets = self
            .routing
            .lock()
            .unwrap()
            .idle_bucket_refresh_targets(self.config.routing.refresh_interval);

        let mut refreshes: FuturesUnordered<_> =
            targets.into_iter().map(|target| self.find_node(target)).collect();
        while refreshes.next().await.is_some() {}
    }
}

/// Returns `id` with bit `i` (0 = most significant) toggled.
fn flip_bit(id: Id, i: usize) -> Id {
    if id.bit(i) {
        id & !Id::ZERO.set_bit(i)
    } else {
        id.set_bit(i)
    }
}

/// Whether `self_id` would belong among the `bucket_size` nodes closest to
/// `key`, given the `nodes` a FIND_NODE lookup for `key` actually returned.
/// `find_node` structurally never returns `self` (the routing table never
/// stores the owner's own id), so `store` can't just check `nodes` for
/// self-membership — it has to compare distances instead: self belongs if
/// the returned set isn't even full yet, or if self is closer than its
/// current farthest member. `nodes` is assumed sorted by ascending distance
/// to `key`, which is what `find_node` returns.
fn self_is_among_closest(self_id: Id, key: Id, nodes: &[Contact], bucket_size: usize) -> bool {
    nodes.len() < bucket_size
        || nodes
            .last()
            .map_or(false, |farthest| (self_id ^ key) < (farthest.id() ^ key))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn contact(id: Id) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 1234)
    }

    #[test]
    fn self_belongs_when_closest_set_is_not_full() {
        let key = Id::from_hex("50");
        let nodes = vec![contact(Id::from_hex("51"))];
        assert!(self_is_among_closest(Id::from_hex("10"), key, &nodes, 8));
    }

    #[test]
    fn self_belongs_when_closer_than_the_farthest_known() {
        let key = Id::ZERO;
        let nodes = vec![contact(Id::from_hex("80"))];
        // self (0x40) is closer to the key than the lone known node (0x80).
        assert!(self_is_among_closest(Id::from_hex("40"), key, &nodes, 1));
    }

    #[test]
    fn self_does_not_belong_when_the_closest_set_is_full_and_farther() {
        let key = Id::ZERO;
        let nodes = vec![contact(Id::from_hex("01"))];
        // self (0xff) is farther from the key than the known node (0x01),
        // and the returned set already has `bucket_size` entries.
        assert!(!self_is_among_closest(Id::from_hex("ff"), key, &nodes, 1));
    }
}

impl<T: TransportSender> TransportListener for KademliaDht<T> {
    fn on_request<'a>(
        &'a self,
        source_host: IpAddr,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>> {
        Box::pin(dispatch::on_request(
            self.self_envelope(),
            &self.transport,
            &self.routing,
            &self.store,
            self.config.routing.rpc_timeout,
            self.config.routing.max_ping_interval,
            source_host,
            request,
        ))
    }
}
