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

use std::fmt::{Display, Formatter};

/// Error kinds surfaced to the RPC layer alongside every partition response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i16)]
pub enum ErrorKind {
    #[default]
    None = 0,
    Unknown = -1,

    /// transient, the caller may retry or long-poll
    BrokerBusy = 1001,
    NoData = 1002,

    /// read errors
    SomeMessageLost = 2001,
    SessionChanged = 2002,
    SealedTopicReadFinish = 2003,
    DecompressMessage = 2004,
    InitFieldFilterFailed = 2005,

    /// write errors
    WriteVersionInvalid = 3001,
    PermissionDenied = 3002,
    TopicSealed = 3003,

    /// generic request error
    InvalidRequest = 4001,
    PartitionNotRunning = 4002,
}

impl ErrorKind {
    pub fn is_ok(&self) -> bool {
        *self == ErrorKind::None
    }

    /// `BrokerBusy` and `NoData` are the only kinds a client should retry as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::BrokerBusy | ErrorKind::NoData)
    }

    pub fn code(&self) -> i16 {
        *self as i16
    }
}

impl From<i16> for ErrorKind {
    fn from(value: i16) -> Self {
        match value {
            0 => ErrorKind::None,
            1001 => ErrorKind::BrokerBusy,
            1002 => ErrorKind::NoData,
            2001 => ErrorKind::SomeMessageLost,
            2002 => ErrorKind::SessionChanged,
            2003 => ErrorKind::SealedTopicReadFinish,
            2004 => ErrorKind::DecompressMessage,
            2005 => ErrorKind::InitFieldFilterFailed,
            3001 => ErrorKind::WriteVersionInvalid,
            3002 => ErrorKind::PermissionDenied,
            3003 => ErrorKind::TopicSealed,
            4001 => ErrorKind::InvalidRequest,
            4002 => ErrorKind::PartitionNotRunning,
            _ => ErrorKind::Unknown,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}
