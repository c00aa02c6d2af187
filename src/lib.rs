// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![warn(clippy::format_push_string)]

pub mod connection;
pub mod db;
pub mod engine;
pub mod host;
pub mod job;
pub mod resource;
pub mod rpc;
pub mod scheduler;
pub mod transfer;
pub mod workflow;

use std::io;
use std::path::PathBuf;

/// The name of the directory holding the engine's persistent state, relative
/// to a resource's data root.
pub const DATA_DIRECTORY_NAME: &str = ".weft";

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 2;

/// Default control loop interval in seconds.
pub const DEFAULT_CONTROL_INTERVAL_SECS: u64 = 3;

/// Default number of tunnel connectivity probe attempts.
pub const DEFAULT_TUNNEL_PROBE_ATTEMPTS: u32 = 10;

/// Errors that may be encountered when using the weft crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // OS errors
    #[error("OS error")]
    OS(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("Unable to spawn '{0}': {1}.")]
    SpawnProcess(String, #[source] io::Error),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] io::Error),

    // serialization errors
    #[error("Unable to parse '{0}': {1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    #[error("Unable to parse '{0}': {1}")]
    PostcardParse(PathBuf, #[source] postcard::Error),

    #[error("Unable to serialize '{0}': {1}")]
    PostcardSerialize(PathBuf, #[source] postcard::Error),

    #[error("Unable to parse message: {0}")]
    PostcardMessage(#[source] postcard::Error),

    // job / scheduler errors
    #[error("Job has no identifier.")]
    InvalidJob,

    #[error("Unknown job '{0}'.")]
    UnknownJob(String),

    #[error("Unknown transfer '{0}'.")]
    UnknownTransfer(String),

    #[error("Transfer '{0}' still has {1} live reference(s).")]
    TransferInUse(String, usize),

    // workflow errors
    #[error("Workflow dependencies contain a cycle.")]
    CyclicWorkflow,

    #[error("Dependency references unknown node '{0}'.")]
    DanglingDependency(String),

    #[error("Unknown workflow '{0}'.")]
    UnknownWorkflow(String),

    #[error("'{0}' does not belong to the caller.")]
    PermissionDenied(String),

    // connection / host errors
    #[error("Unknown resource '{0}'.")]
    UnknownResource(String),

    #[error("Could not determine the user's home directory.")]
    NoHome,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport closed.")]
    TransportClosed,

    #[error("Interrupted")]
    Interrupted,
}
