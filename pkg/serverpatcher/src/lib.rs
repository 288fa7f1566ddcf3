// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Unattended OS patching for Linux servers.
//!
//! A run detects the host, picks the native package manager, refreshes and
//! upgrades under a deadline, and leaves a JSON report behind. The daemon
//! repeats that on a jittered interval.

pub mod backend;
pub mod cli;
pub mod config;
pub mod context;
pub mod exec;
pub mod health;
pub mod host;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod osinfo;
pub mod qos;
pub mod report;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;
