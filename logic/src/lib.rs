#![forbid(unsafe_code)]

pub mod config;
pub mod consts;
pub mod contact;
pub mod rpc;
pub mod search;
pub mod simulate;
mod dht;
mod dispatch;
mod id;
mod kbucket;
mod routing;
mod storage;

pub use contact::{Contact, SenderEnvelope};
pub use dht::KademliaDht;
pub use id::{Id, IdRange};
pub use storage::{InMemoryValueStore, StorageError, ValueStore};
