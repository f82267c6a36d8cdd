// Copyright (c) 2023 QFaaS Authors
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

use serde_json::Error as SerdeJsonError;
use tonic::Status as TonicStatus;
use std::num::ParseIntError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    CommonError(String),

    // scheduling errors, surfaced through the rpc boundary
    InvalidArgument(String),
    NodeLimitReached,
    RmRpcFailed(String),
    NodeRpcFailed(String),
    AcquireTimeout(String),

    TonicStatus(TonicStatus),
    TonicTransportErr(tonic::transport::Error),
    SerdeJsonError(SerdeJsonError),
    StdIOErr(std::io::Error),
    ParseIntError(ParseIntError),
    TokioChannFull,
    TokioChannClose,
}

impl Error {
    pub fn ToStatus(&self) -> TonicStatus {
        match self {
            Error::InvalidArgument(s) => TonicStatus::invalid_argument(s.as_str()),
            Error::NodeLimitReached => {
                TonicStatus::resource_exhausted("node maximum limit reached")
            }
            Error::RmRpcFailed(s) => TonicStatus::unavailable(s.as_str()),
            Error::NodeRpcFailed(s) => TonicStatus::unavailable(s.as_str()),
            Error::AcquireTimeout(s) => TonicStatus::deadline_exceeded(s.as_str()),
            e => TonicStatus::internal(format!("{:?}", e)),
        }
    }
}

impl From<Error> for String {
    fn from(item: Error) -> Self {
        return format!("{:?}", item);
    }
}

impl From<SerdeJsonError> for Error {
    fn from(item: SerdeJsonError) -> Self {
        return Self::SerdeJsonError(item);
    }
}

impl From<TonicStatus> for Error {
    fn from(item: TonicStatus) -> Self {
        return Self::TonicStatus(item);
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(item: tonic::transport::Error) -> Self {
        return Self::TonicTransportErr(item);
    }
}

impl From<std::io::Error> for Error {
    fn from(item: std::io::Error) -> Self {
        return Self::StdIOErr(item);
    }
}

impl From<ParseIntError> for Error {
    fn from(item: ParseIntError) -> Self {
        return Self::ParseIntError(item);
    }
}

impl<T> From<tokio::sync::mpsc::error::SendTimeoutError<T>> for Error {
    fn from(item: tokio::sync::mpsc::error::SendTimeoutError<T>) -> Self {
        match item {
            tokio::sync::mpsc::error::SendTimeoutError::Timeout(_) => {
                return Self::TokioChannFull;
            }
            tokio::sync::mpsc::error::SendTimeoutError::Closed(_) => {
                return Self::TokioChannClose;
            }
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for Error {
    fn from(item: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match item {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                return Self::TokioChannFull;
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                return Self::TokioChannClose;
            }
        }
    }
}
