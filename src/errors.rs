use thiserror::Error;

/// Everything that can go wrong between a plaintext byte and a covert string.
///
/// Per-stream errors stay inside the stream that raised them; the listeners
/// log and keep accepting. Construction-time errors (`BuildFailed`,
/// `InsufficientCapacity`, `FailedToBind`) are fatal to the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("language has no words in its fixed-length slice")]
    LanguageIsEmpty,

    #[error("string is not in the language (or has the wrong length)")]
    NotInLanguage,

    #[error("integer is outside the rankable slice")]
    OutOfRange,

    #[error("regex did not compile to a usable DFA: {0}")]
    BuildFailed(String),

    #[error("language capacity {0} bits cannot hold a {1}-bit cell")]
    InsufficientCapacity(usize, usize),

    #[error("need more input")]
    PopFailed,

    #[error("end of stream")]
    EndOfStream,

    #[error("unrecoverable decryption failure")]
    UnrecoverableDecryptionFailure,

    #[error("no known language decodes the negotiation cell")]
    NegotiationFailed,

    #[error("negotiation did not complete in time")]
    NegotiateTimeout,

    #[error("outgoing language model cannot emit further strings")]
    TcpReset,

    #[error("cell belongs to stream {0}")]
    NotMyStream(u32),

    #[error("channel not ready (negotiation incomplete)")]
    ChannelNotReady,

    #[error("failed to bind {0}")]
    FailedToBind(String),
}

pub type Result<T> = std::result::Result<T, Error>;
