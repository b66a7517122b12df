use std::collections::HashSet;
use std::sync::Mutex;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::{
    config::RoutingConfig,
    contact::{Contact, SenderEnvelope},
    id::Id,
    routing::RoutingTable,
    rpc::{Request, Response, TransportError, TransportSender},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupKind {
    Nodes,
    Value,
}

#[derive(Debug)]
pub enum LookupOutcome {
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum QueryState {
    Waiting,
    Querying,
    Queried,
}

fn sort_window(window: &mut [(QueryState, Contact)], target: Id) {
    window.sort_by_key(|(_, c)| c.id() ^ target);
}

fn start_query<'s, T: TransportSender>(
    target: Id,
    kind: LookupKind,
    sender: &'s T,
    owner_envelope: SenderEnvelope,
    rpc_timeout: std::time::Duration,
    window: &mut [(QueryState, Contact)],
) -> Option<impl std::future::Future<Output = (Id, Result<Response, TransportError>)> + 's> {
    let entry = window
        .iter_mut()
        .find(|(state, _)| *state == QueryState::Waiting)?;
    // Picking the first waiting entry always picks the closest unqueried
    // contact, since the window stays sorted by distance after every fold.
    entry.0 = QueryState::Querying;
    let to = entry.1.clone();
    let request = match kind {
        LookupKind::Nodes => Request::FindNode(target, owner_envelope),
        LookupKind::Value => Request::FindValue(target, owner_envelope),
    };
    let fut = sender.send(&to, request);
    Some(async move {
        // Every RPC the lookup fires carries its own deadline (§4.F, §5): a
        // single unresponsive contact must free up its `alpha` slot long
        // before the lookup's overall deadline, or one bad peer could starve
        // the whole round.
        let result = match tokio::time::timeout(rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        (to.id(), result)
    })
}

/// The iterative α-parallel lookup (§4.H): maintains a window of the
/// `bucket_size` closest known contacts, queries up to `alpha` unqueried ones
/// at a time, and folds each reply's nodes back into the window. Serves both
/// FIND_NODE and FIND_VALUE — a FIND_VALUE lookup returns the instant any
/// queried node answers with the value, without waiting for the rest of the
/// round to settle. The whole lookup is bounded by `config.lookup_timeout`;
/// past that deadline the best-known window is returned instead of the
/// answer the source would have blocked forever for.
#[instrument(skip(sender, owner_envelope, routing, config, initial_shortlist), fields(target = ?target))]
pub async fn run<T: TransportSender>(
    target: Id,
    kind: LookupKind,
    initial_shortlist: Vec<Contact>,
    owner_id: Id,
    sender: &T,
    owner_envelope: SenderEnvelope,
    routing: &Mutex<RoutingTable>,
    config: &RoutingConfig,
) -> LookupOutcome {
    let mut queried: HashSet<Id> = initial_shortlist.iter().map(Contact::id).collect();
    queried.insert(owner_id);

    let mut window: Vec<(QueryState, Contact)> = initial_shortlist
        .into_iter()
        .map(|c| (QueryState::Waiting, c))
        .collect();
    sort_window(&mut window, target);

    let rounds = run_rounds(
        target,
        kind,
        sender,
        owner_envelope,
        routing,
        config.bucket_size,
        config.alpha,
        config.rpc_timeout,
        &mut queried,
        &mut window,
    );

    match tokio::time::timeout(config.lookup_timeout, rounds).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("lookup deadline exceeded; returning best-known nodes");
            LookupOutcome::Nodes(window.into_iter().map(|(_, c)| c).collect())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_rounds<T: TransportSender>(
    target: Id,
    kind: LookupKind,
    sender: &T,
    owner_envelope: SenderEnvelope,
    routing: &Mutex<RoutingTable>,
    bucket_size: usize,
    alpha: usize,
    rpc_timeout: std::time::Duration,
    queried: &mut HashSet<Id>,
    window: &mut Vec<(QueryState, Contact)>,
) -> LookupOutcome {
    let pending: FuturesUnordered<_> = (0..alpha)
        .filter_map(|_| start_query(target, kind, sender, owner_envelope, rpc_timeout, window))
        .collect();
    let mut available = alpha - pending.len();
    tokio::pin!(pending);

    while let Some((id, result)) = pending.next().await {
        available += 1;

        let contact = window
            .iter_mut()
            .find(|(_, c)| c.id() == id)
            .map(|entry| {
                entry.0 = QueryState::Queried;
                entry.1.clone()
            });

        debug!(?id, "lookup rpc settled");

        match result {
            Err(err) => debug!(?id, %err, "lookup rpc failed"),
            Ok(Response::FoundNodes(nodes, responder)) => {
                if responder.id != id {
                    warn!(?id, "response envelope id mismatch, discarding");
                } else {
                    if let Some(contact) = contact {
                        routing.lock().unwrap().insert(contact);
                    }
                    let fresh: Vec<Contact> = nodes
                        .into_iter()
                        .filter(|n| queried.insert(n.id))
                        .map(|n| Contact::new(n.id, n.host, n.port))
                        .collect();
                    window.extend(fresh.into_iter().map(|c| (QueryState::Waiting, c)));
                    sort_window(window, target);
                    window.truncate(bucket_size);
                }
            }
            Ok(Response::FoundValue(value, responder)) => {
                if kind == LookupKind::Value {
                    if responder.id == id {
                        if let Some(contact) = contact {
                            routing.lock().unwrap().insert(contact);
                        }
                    }
                    return LookupOutcome::Value(value);
                }
                warn!(?id, "node returned a value to a node-only lookup");
            }
            Ok(Response::Pong(_) | Response::Stored(_)) => {
                warn!(?id, "node returned an unexpected reply shape to a lookup rpc");
            }
            Ok(Response::Error) => warn!(?id, "node returned an error"),
        }

        while available > 0 {
            match start_query(target, kind, sender, owner_envelope, rpc_timeout, window) {
                Some(fut) => {
                    pending.push(fut);
                    available -= 1;
                }
                None => break,
            }
        }

        if window.iter().all(|(state, _)| *state == QueryState::Queried) {
            // Every contact in the closest-known window has answered and
            // surfaced nothing closer; the lookup has converged.
            break;
        }
    }

    LookupOutcome::Nodes(window.iter().map(|(_, c)| c.clone()).collect())
}
