#![doc = include_str!("../README.md")]
#![deny(
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![forbid(non_ascii_idents, unsafe_code)]
#![warn(
    deprecated_in_future,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications
)]

mod backend;
mod client;
mod config;
mod dropguard;
mod error;
mod listen;
pub mod pool;
mod registry;
mod statements;
mod subscriber;
mod values;

pub use self::backend::Service;
pub use self::client::{PgClient, PgSettings, QueryResult, RowSet};
pub use self::config::{
    BackendConfig, ExclusiveConfig, MultiplexedConfig, PooledConfig, ServiceConfig,
    PREPARED_STATEMENT_CACHE_SIZE_ENV,
};
pub use self::error::{Error, TxOp};
pub use self::listen::{ErrorCallback, ListenGuard, NotifyCallback};
pub use self::registry::{acquire, default_grace, SharedService, RELEASE_GRACE_ENV};
pub use self::statements::{cleanup_all, StatementCache, StatementCaches};
pub use self::subscriber::{Subscriber, Subscription};
pub use self::values::SqlValue;

pub use tokio_postgres;
