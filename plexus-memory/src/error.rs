// Copyright 2025 plexus Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Atom cache errors.
//!
//! Only configuration and construction are fallible. Runtime contract
//! violations (a nil handle where a real one is required, duplicate
//! insertion of a resident persistent handle) panic instead: silently
//! accepting them would corrupt the one-live-handle-per-atom invariant.

/// Atom cache error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Atom cache result.
pub type Result<T> = std::result::Result<T, Error>;
