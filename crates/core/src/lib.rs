//! Core model for the Arque event-sourcing runtime: identifiers, the event
//! record and its companions, the canonical value encoding, the wire codec,
//! the shared error taxonomy, and the backoff/retry utility.

pub mod codec;
pub mod error;
pub mod event;
pub mod id;
pub mod retry;
pub mod value;

pub use codec::{EventCodec, FRAME_VERSION, peek_event_type};
pub use error::{CodecError, IdError, StoreError, StreamError, ValueError};
pub use event::{
    AggregateRecord, AggregateRef, CTX_META_KEY, Event, EventMeta, ProjectionCheckpoint, Snapshot,
    StreamRegistration,
};
pub use id::{AGGREGATE_ID_LEN, AggregateId, EventId};
pub use retry::{RetryPolicy, retry};
pub use value::{SerializerRegistry, Value};
