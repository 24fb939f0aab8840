pub mod error;
pub mod state;
pub mod ledger;
pub mod pacing;
pub mod provider;
pub mod upstream;
pub mod lifecycle;
pub mod fetcher;
pub mod registry;
pub mod dispatch_loop;
pub mod worker;

// Re-export key types
pub use error::{LedgerError, UpstreamError};
pub use state::{Claim, DispatchState, InFlightGuard, MergeReport, SkipReason, StateSnapshot};
pub use ledger::{DispatchLedger, InMemoryLedgerStore, JsonFileLedgerStore, LedgerStore};
pub use pacing::{CyclePause, DelayWindow, PacingPolicy};
pub use provider::{classify_status, HttpMessageSender, MessageSender, SendPayload, SenderConfig};
pub use upstream::{
    decode_queue_response, Confirmer, FetchedBatch, HttpUpstream, InstanceSource, QueueResponse,
    QueueSource, UpstreamConfig,
};
pub use fetcher::{FetchOutcome, QueueFetcher};
pub use registry::{InstanceRegistry, InstanceStatus, RegistryDiff};
pub use dispatch_loop::{
    DispatchContext, DispatchLoop, DispatchResult, DispatchSettings, LoopPhase,
};
pub use worker::{DispatchWorker, WorkerConfig, WorkerDeps, WorkerStats};
