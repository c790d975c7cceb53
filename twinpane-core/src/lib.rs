mod activity;
pub mod backend;
mod config;
mod entry;
mod error;
pub mod paths;
pub mod pool;
pub mod retry;
mod source;
pub mod transfer;

pub use activity::{
    Activity, ChannelNotifier, DEFAULT_TICK, ExpectedFailure, Notification, NotificationSink,
    Progress, TaskHandle, TaskSnapshot, TaskState, TracingNotifier,
};
pub use config::{ChunkedUploadConfig, Clients, SourceConfig, SourceProfile};
pub use entry::{Entry, EntryMeta};
pub use error::SourceError;
pub use source::{Backend, ListingPolicy, Source, SourceKind, SourceState};
pub use transfer::copy_entry;
