// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! mai-bus hub
//!
//! Host process around a [`mai_bus::Service`]: environment configuration,
//! an api-key table, a relay between users, and HTTP health/metrics.

pub mod auth;
pub mod config;
pub mod http;
pub mod metrics;
pub mod relay;
