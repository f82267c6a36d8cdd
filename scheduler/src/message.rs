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

use std::time::SystemTime;

use fshare::sched;

// completion report carried on the router's return channel
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub requestId: String,
    pub containerId: String,
    pub maxMemoryUsageInBytes: i64,
    pub durationInMs: i64,
    // when the report entered the channel, for return latency stamping
    pub enqueueTime: SystemTime,
}

impl ResponseInfo {
    pub fn New(req: &sched::ReturnContainerRequest) -> Self {
        return Self {
            requestId: req.request_id.clone(),
            containerId: req.container_id.clone(),
            maxMemoryUsageInBytes: req.max_memory_usage_in_bytes,
            durationInMs: req.duration_in_nanos / 1_000_000,
            enqueueTime: SystemTime::now(),
        };
    }
}
