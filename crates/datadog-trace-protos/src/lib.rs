// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-maintained protobuf models for the Datadog trace intake API.
//!
//! These mirror the `datadog.trace` protobuf definitions used by the trace
//! intake (`/api/v0.2/traces`). Spans additionally derive `serde` so that the
//! same type can be used for msgpack/JSON ingestion at the receiver boundary.

pub mod pb {
    use serde::{Deserialize, Serialize};

    /// A single timed operation within a trace.
    #[derive(Deserialize, Serialize)]
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Span {
        /// service is the name of the service with which this span is associated.
        #[prost(string, tag = "1")]
        #[serde(default)]
        pub service: ::prost::alloc::string::String,
        /// name is the operation name of this span.
        #[prost(string, tag = "2")]
        pub name: ::prost::alloc::string::String,
        /// resource is the resource name of this span, also sometimes called the endpoint (for web spans).
        #[prost(string, tag = "3")]
        pub resource: ::prost::alloc::string::String,
        /// traceID is the ID of the trace to which this span belongs.
        #[prost(uint64, tag = "4")]
        pub trace_id: u64,
        /// spanID is the ID of this span.
        #[prost(uint64, tag = "5")]
        pub span_id: u64,
        /// parentID is the ID of this span's parent, or zero if this span has no parent.
        #[prost(uint64, tag = "6")]
        #[serde(default)]
        pub parent_id: u64,
        /// start is the number of nanoseconds between the Unix epoch and the beginning of this span.
        #[prost(int64, tag = "7")]
        pub start: i64,
        /// duration is the time length of this span in nanoseconds.
        #[prost(int64, tag = "8")]
        pub duration: i64,
        /// error is 1 if there is an error associated with this span, or 0 if there is not.
        #[prost(int32, tag = "9")]
        #[serde(default)]
        pub error: i32,
        /// meta is a mapping from tag name to tag value for string-valued tags.
        #[prost(map = "string, string", tag = "10")]
        #[serde(default)]
        pub meta: ::std::collections::HashMap<
            ::prost::alloc::string::String,
            ::prost::alloc::string::String,
        >,
        /// metrics is a mapping from tag name to tag value for numeric-valued tags.
        #[prost(map = "string, double", tag = "11")]
        #[serde(default)]
        pub metrics: ::std::collections::HashMap<::prost::alloc::string::String, f64>,
        /// type is the type of the service with which this span is associated.  Example values: web, db, lambda.
        #[prost(string, tag = "12")]
        #[serde(default, rename = "type")]
        pub r#type: ::prost::alloc::string::String,
    }

    /// APITrace is a list of spans sharing a trace ID, as encoded for the intake.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ApiTrace {
        /// traceID is the shared trace ID of all spans in this trace.
        #[prost(uint64, tag = "1")]
        pub trace_id: u64,
        /// spans specifies the spans of this trace.
        #[prost(message, repeated, tag = "2")]
        pub spans: ::prost::alloc::vec::Vec<Span>,
        /// startTime is the earliest span start in this trace, in nanoseconds.
        #[prost(int64, tag = "6")]
        pub start_time: i64,
        /// endTime is the latest span end in this trace, in nanoseconds.
        #[prost(int64, tag = "7")]
        pub end_time: i64,
    }

    /// TracePayload is the payload the agent posts to the trace intake.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TracePayload {
        /// hostName specifies the hostname of where the agent is running.
        #[prost(string, tag = "1")]
        pub host_name: ::prost::alloc::string::String,
        /// env specifies the `env` set in agent configuration.
        #[prost(string, tag = "2")]
        pub env: ::prost::alloc::string::String,
        /// traces specifies the list of sampled traces.
        #[prost(message, repeated, tag = "3")]
        pub traces: ::prost::alloc::vec::Vec<ApiTrace>,
        /// transactions specifies spans extracted as standalone analyzed events.
        #[prost(message, repeated, tag = "4")]
        pub transactions: ::prost::alloc::vec::Vec<Span>,
    }
}
