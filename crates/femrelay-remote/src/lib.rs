//! Remote-shell plumbing for femrelay.
//!
//! Invoke scripts against worker nodes, decode their output, serialize access
//! per node, and move directory trees back and forth.

pub mod command;
pub mod encoding;
pub mod queue;
pub mod runner;
pub mod transfer;

pub use command::{
    CommandError, CommandEvent, EventKind, ExecutionRecord, RemoteCommand, ScriptTransport,
};
pub use encoding::{StreamDecoder, TextEncoding, UnknownEncoding};
pub use queue::{QueueError, QueueMode, QueueRegistry, SerialQueue};
pub use runner::{Invocation, RemoteRunner, ScriptRunner, ScriptedResponse, ScriptedRunner};
pub use transfer::{
    FileTransferService, RECEIVE_SCRIPT, SEND_SCRIPT, TransferDirection, TransferError,
    TransferFailure, TransferHooks, TransferOptions, TransferResult, validate_transfer_options,
};
