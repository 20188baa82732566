// Copyright 2025 framewire contributors
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

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// transport errors
    #[error("accept error: {0}")]
    Accept(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// framing errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
