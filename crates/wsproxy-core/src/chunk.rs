/// Element of a relay queue.
///
/// `End` is the end-of-stream sentinel. It is a distinct variant so that a
/// zero-length `Data` can never be mistaken for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    End,
}

impl Chunk {
    /// Map an inbound binary message to a chunk: a zero-length message is
    /// the client's end-of-session signal.
    pub fn from_message_payload(payload: Vec<u8>) -> Self {
        if payload.is_empty() {
            Chunk::End
        } else {
            Chunk::Data(payload)
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Chunk::End)
    }
}
