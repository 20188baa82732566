mod buffer;
mod codec;
mod service;
mod session;
mod transport;
mod worker;

pub use buffer::{BufferPool, IoBuf, DEFAULT_CHUNK_SIZE, MAX_BUF_SIZE};
pub use codec::{
    Extracted, FrameCodec, MessageCodec, StringCodec, STATE_WAIT_FOR_BODY, STATE_WAIT_FOR_HEADER,
};
pub use service::{
    setup_local_tracing, setup_tracing, BufferPoolConfig, EngineConfig, NetworkConfig,
    SessionConfig, Shutdown, WireError, WireResult, WorkerPoolConfig,
};
pub use session::{
    BoxedReader, BoxedWriter, Direction, Handler, IoDirection, ProcessFlags, ScratchValue,
    Session, SessionParts, SessionRegistry, SessionState, KIND_INCOMING, KIND_OUTGOING,
};
pub use transport::{Client, Server};
pub use worker::{Work, WorkerPool};
