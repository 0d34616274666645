//! Typed - 型付き Task API
//!
//! task_type の typo を型で排除し、Handler との対応付けを静的に保証します。
//! The queue core only ever sees `Box<dyn Task>`; this layer produces them.

pub mod codec;
pub mod handler;
pub mod registry;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use self::codec::{CodecError, PayloadCodec};
pub use self::handler::{Handler, TaskFactory, TypedFactory, TypedTask};
pub use self::registry::{ReconstituteError, RegistryError, TaskRegistry};
pub use self::task::TaskPayload;
