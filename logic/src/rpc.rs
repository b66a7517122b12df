use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::{contact::Contact, contact::SenderEnvelope, id::Id};

/// One of the four wire operations. Every request carries the caller's own
/// sender envelope so the callee can register it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Request {
    Ping(SenderEnvelope),
    FindNode(Id, SenderEnvelope),
    Store(Id, Vec<u8>, SenderEnvelope),
    FindValue(Id, SenderEnvelope),
}

impl Request {
    pub fn sender(&self) -> SenderEnvelope {
        match self {
            Request::Ping(s) => *s,
            Request::FindNode(_, s) => *s,
            Request::Store(_, _, s) => *s,
            Request::FindValue(_, s) => *s,
        }
    }
}

/// A contact as returned in a `FoundNodes` reply: the sender envelope
/// augmented with the host address the responder observed or knows it by
/// (§6: "FIND_NODE replies return a list of envelopes augmented with host").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FoundContact {
    pub id: Id,
    pub host: IpAddr,
    pub port: u16,
}

impl From<&Contact> for FoundContact {
    fn from(c: &Contact) -> Self {
        FoundContact {
            id: c.id(),
            host: c.host(),
            port: c.port(),
        }
    }
}

/// The reply to one of the four wire operations. Every reply carries the
/// responder's own sender envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Response {
    Pong(SenderEnvelope),
    FoundNodes(Vec<FoundContact>, SenderEnvelope),
    /// The FIND_VALUE discriminated union's `{value}` branch.
    FoundValue(Vec<u8>, SenderEnvelope),
    /// Ack for STORE.
    Stored(SenderEnvelope),
    /// Generic bad response; should never be produced by a correct peer.
    Error,
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("rpc timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// The RPC client stub (§4.F): sends one typed request to one contact and
/// awaits a typed reply. Implementers are responsible for the actual byte
/// framing; the core only needs an awaitable `Result`.
///
/// Per-call timeouts are layered on top of this trait by the lookup engine
/// and the stale-eviction protocol (`tokio::time::timeout`), not by the
/// implementor — the source has none, and imposing a finite deadline here is
/// the required hardening called out in §4.F/§5.
pub trait TransportSender: Clone + Send + Sync + 'static {
    type Fut: Future<Output = Result<Response, TransportError>> + Send;

    fn send(&self, to: &Contact, request: Request) -> Self::Fut;
}

/// The RPC server dispatcher's transport-facing half (§4.G): invoked by the
/// transport every time a request arrives, with the address it was actually
/// observed from (never the self-reported one in the envelope).
///
/// Handling a request may itself need to make an outbound call (the
/// stale-eviction protocol pings a bucket's head before evicting it), so this
/// returns a boxed future rather than a plain `Response`.
pub trait TransportListener: Send + Sync {
    fn on_request<'a>(
        &'a self,
        source_host: IpAddr,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>>;
}
