//! Building rock services.
//!
//! A service is a [`Dispatcher`] (declared with [`ServiceBuilder`]) run by a
//! [`Service`], which registers with the broker as a worker and answers
//! `{method, args}` requests. Handlers may queue background work on a
//! [`TaskPool`] and keep documents in a [`Store`].

pub mod dispatch;
pub mod error;
pub mod service;
pub mod store;
pub mod tasks;

pub use dispatch::{
    Args, Dispatcher, Handler, HandlerError, HandlerResult, INFO_METHOD, RpcReply, ServiceBuilder,
};
pub use error::{ServiceError, ServiceResult, StoreError, StoreResult};
pub use service::{DEFAULT_BROKER, Service, ServiceConfig};
pub use store::{MemoryStore, Store, open_store};
pub use tasks::{TaskEmitter, TaskPool, TaskPoolBuilder};
