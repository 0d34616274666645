//! PayloadCodec - TaskPayload と payload bytes の相互変換

use thiserror::Error;

use super::task::TaskPayload;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode {task_type}: {source}")]
    Encode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode {task_type}: {source}")]
    Decode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON codec for typed payloads.
///
/// The store never looks inside the bytes; only this codec and the handler's
/// payload type agree on the format.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: TaskPayload>(payload: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: TaskPayload>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }
}
