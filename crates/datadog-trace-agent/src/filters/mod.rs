// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace filters applied ahead of sampling: resource blacklisting and
//! tag value replacement.

pub mod blacklist;
pub mod replacer;

pub use blacklist::Blacklister;
pub use replacer::{ReplaceRule, Replacer};
