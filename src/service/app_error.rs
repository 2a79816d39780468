// Copyright 2025 jonefeewang@gmail.com
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

use crate::message::CodecError;
use crate::request::ErrorKind;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// codec and compression errors
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("decompress message failed: {0}")]
    DecompressMessage(String),

    #[error("init field filter failed: {0}")]
    InitFieldFilterFailed(String),

    /// partition errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("partition not running: {0}")]
    PartitionNotRunning(String),

    #[error("mirror source error: {0}")]
    MirrorSource(String),
}

impl From<&AppError> for ErrorKind {
    fn from(value: &AppError) -> Self {
        match value {
            AppError::Codec(_) | AppError::DecompressMessage(_) => ErrorKind::DecompressMessage,
            AppError::InitFieldFilterFailed(_) => ErrorKind::InitFieldFilterFailed,
            AppError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            AppError::PartitionNotRunning(_) => ErrorKind::PartitionNotRunning,
            _ => ErrorKind::Unknown,
        }
    }
}
