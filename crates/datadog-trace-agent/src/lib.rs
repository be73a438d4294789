// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace agent core.
//!
//! Ingests traces from local application processes, normalizes and enriches
//! them, samples them through a stratified reservoir and ships the survivors
//! to the trace intake in compressed protobuf batches.
//!
//! The external collaborators (HTTP receiver, stats concentrator, metrics
//! exporter, obfuscator) plug in through the channel handles and traits
//! exposed by [`agent::Agent`], [`telemetry::MetricsClient`] and
//! [`writer::PayloadSender`].

pub mod agent;
pub mod config;
pub mod filters;
pub mod model;
pub mod sampler;
pub mod telemetry;
pub mod writer;
