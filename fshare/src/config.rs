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

use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::*;

pub const DEFAULT_SCHED_PORT: u16 = 10600;
pub const DEFAULT_RM_ADDR: &str = "http://127.0.0.1:10500";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    // cap on leased nodes
    pub maxNodeNum: usize,
    // deadline for ReserveNode/CreateContainer rpcs
    pub timeoutMs: u64,
    // short wait on the idle channel / return enqueue
    pub channelTimeoutMs: u64,
    // long fallback wait on the idle channel
    pub waitChannelTimeoutMs: u64,

    pub rmAddr: String,
    pub svcPort: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        return Self {
            maxNodeNum: 20,
            timeoutMs: 10 * 1000,
            channelTimeoutMs: 300,
            waitChannelTimeoutMs: 5 * 1000,
            rmAddr: DEFAULT_RM_ADDR.to_owned(),
            svcPort: DEFAULT_SCHED_PORT,
        };
    }
}

impl SchedulerConfig {
    pub fn Load(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        return Ok(config);
    }

    pub fn Timeout(&self) -> Duration {
        return Duration::from_millis(self.timeoutMs);
    }

    pub fn ChannelTimeout(&self) -> Duration {
        return Duration::from_millis(self.channelTimeoutMs);
    }

    pub fn WaitChannelTimeout(&self) -> Duration {
        return Duration::from_millis(self.waitChannelTimeoutMs);
    }
}
