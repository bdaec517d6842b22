// Copyright 2024 Event Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # Event Relayer Crate
//!
//! A crate for relaying smart-contract events across chains.
//!
//! ## Overview
//!
//! The relayer observes events emitted by contracts on a set of source
//! chains, obtains a cryptographic inclusion proof for each observed event
//! from an external proof service, and submits a method invocation carrying
//! that proof to a destination contract on another chain. A single event
//! may be relayed to one or several destinations, decided by configurable
//! resolvers.
//!
//! The pipeline is built from four cooperating pieces:
//!
//!   1. One [`events_watcher::ChainListener`] per source chain sweeps
//!      finalised blocks, decodes matching logs and writes durable relay
//!      jobs.
//!   2. The [`store`] persists each job and its state machine, so a
//!      restart resumes exactly where the process stopped and no event is
//!      ever relayed twice to the same destination.
//!   3. The [`queue::JobQueue`] drives jobs through proof retrieval
//!      ([`proof`]) and execution with bounded retries.
//!   4. One [`executor::EvmExecutor`] per destination chain encodes,
//!      signs, submits and confirms the destination calls.
//!
//! Components communicate exclusively through the store; listeners and
//! executors never talk to each other directly.

/// Human-readable schemas, log decoding and call encoding.
pub mod codec;
/// Typed configuration loading, env substitution and validation.
pub mod config;
/// A module for managing the context of the relayer.
pub mod context;
/// The error type of the relayer.
pub mod error;
/// A module that listens for events on a given chain.
pub mod events_watcher;
/// Destination call execution.
pub mod executor;
/// Client for the external proof service.
pub mod proof;
/// The job queue driving the relay state machine.
pub mod queue;
/// Retry policies for async calls.
pub mod retry;
/// Destination resolution strategies.
pub mod resolver;
/// A module for managing the storage of the relayer.
pub mod store;
/// Core value types shared across the components.
pub mod types;
/// A module for starting the long-running background services.
pub mod service;

pub use error::{Error, Result};
