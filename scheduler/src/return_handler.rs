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

use std::sync::atomic::Ordering;

use fshare::common::*;

use crate::message::ResponseInfo;
use crate::router::LatencyMs;
use crate::router::Router;

impl Router {
    // single consumer of the return channel. completion bookkeeping is
    // serialized here: memory credit, hand-off publication, latency stamping.
    pub async fn Process(&self) -> Result<()> {
        let mut rx = self.returnRx.lock().unwrap().take().unwrap();

        loop {
            tokio::select! {
                _ = self.closeNotify.notified() => {
                    self.stop.store(true, Ordering::SeqCst);
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        None => {
                            break;
                        }
                        Some(resp) => {
                            self.ProcessReturn(&resp).await;
                        }
                    }
                }
            }
        }

        return Ok(());
    }

    pub async fn ProcessReturn(&self, resp: &ResponseInfo) {
        let status = match self.GetRequest(&resp.requestId) {
            None => {
                info!(
                    "request id: {}, return with no matching request, drop",
                    &resp.requestId
                );
                return;
            }
            Some(status) => status,
        };

        let container = status.container.clone();
        container.Release(&resp.requestId, status.actualRequireMemory);

        // the node was charged only if this request created the container;
        // ReleaseRequest credits exactly what was charged then
        let node = container.node.clone();
        node.ReleaseRequest(&resp.requestId);

        if container.SendCount() == 0 {
            status
                .function
                .PublishIdle(&container, self.config.ChannelTimeout())
                .await;
        }

        status
            .maxMemoryUsage
            .store(resp.maxMemoryUsageInBytes, Ordering::SeqCst);
        status
            .functionExecutionDuration
            .store(resp.durationInMs, Ordering::SeqCst);
        status
            .scheduleReturnLatency
            .store(LatencyMs(&resp.enqueueTime), Ordering::SeqCst);
        status.responseTime.store(
            status.scheduleAcquireLatency.load(Ordering::SeqCst) + resp.durationInMs,
            Ordering::SeqCst,
        );

        info!(
            "request id: {}, finish, function name: {}\n{}",
            &resp.requestId,
            &status.functionName,
            status.ToJson()
        );

        self.requests.lock().unwrap().remove(&resp.requestId);
    }
}
