// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod config;
pub mod protocol;
pub mod transport;
