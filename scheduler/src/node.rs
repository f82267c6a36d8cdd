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

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time;

use fshare::common::*;
use fshare::ns;

#[derive(Debug)]
pub struct NodeHandleInner {
    // opaque id handed out by the resource manager
    pub nodeId: String,
    // dense number assigned at reservation, defines scan order
    pub nodeNo: u64,
    pub address: String,
    pub port: i32,

    pub totalMemory: i64,
    pub availableMemory: AtomicI64,

    // request_id -> bytes charged on this node at container creation
    pub requests: Mutex<BTreeMap<String, i64>>,
    // container ids hosted on this node
    pub containers: Mutex<BTreeSet<String>>,
}

#[derive(Debug, Clone)]
pub struct NodeHandle(Arc<NodeHandleInner>);

impl Deref for NodeHandle {
    type Target = Arc<NodeHandleInner>;

    fn deref(&self) -> &Arc<NodeHandleInner> {
        &self.0
    }
}

impl NodeHandle {
    pub fn New(nodeId: &str, nodeNo: u64, address: &str, port: i32, memory: i64) -> Self {
        let inner = NodeHandleInner {
            nodeId: nodeId.to_owned(),
            nodeNo: nodeNo,
            address: address.to_owned(),
            port: port,
            totalMemory: memory,
            availableMemory: AtomicI64::new(memory),
            requests: Mutex::new(BTreeMap::new()),
            containers: Mutex::new(BTreeSet::new()),
        };

        return Self(Arc::new(inner));
    }

    pub fn SvcAddr(&self) -> String {
        return format!("http://{}:{}", self.address, self.port);
    }

    pub fn AvailableMemory(&self) -> i64 {
        return self.availableMemory.load(Ordering::SeqCst);
    }

    pub fn ChargeMemory(&self, requestId: &str, amount: i64) {
        self.availableMemory.fetch_sub(amount, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .insert(requestId.to_owned(), amount);
    }

    // undo of a speculative ChargeMemory when container creation fails
    pub fn RollbackMemory(&self, requestId: &str, amount: i64) {
        self.availableMemory.fetch_add(amount, Ordering::SeqCst);
        self.requests.lock().unwrap().remove(requestId);
    }

    // the return pipeline credits the node only for requests it charged,
    // which keeps the node books balanced for warm-path requests.
    pub fn ReleaseRequest(&self, requestId: &str) -> Option<i64> {
        let charged = self.requests.lock().unwrap().remove(requestId);
        match charged {
            None => return None,
            Some(amount) => {
                self.availableMemory.fetch_add(amount, Ordering::SeqCst);
                return Some(amount);
            }
        }
    }

    pub fn RequestCount(&self) -> usize {
        return self.requests.lock().unwrap().len();
    }

    pub fn HasRequest(&self, requestId: &str) -> bool {
        return self.requests.lock().unwrap().contains_key(requestId);
    }

    pub fn InsertContainer(&self, containerId: &str) {
        self.containers
            .lock()
            .unwrap()
            .insert(containerId.to_owned());
    }

    pub fn ContainerCount(&self) -> usize {
        return self.containers.lock().unwrap().len();
    }

    pub async fn CreateContainer(
        &self,
        req: ns::CreateContainerRequest,
        timeout: Duration,
    ) -> Result<String> {
        let addr = self.SvcAddr();
        let ret = time::timeout(timeout, async move {
            let mut client = ns::node_service_client::NodeServiceClient::connect(addr).await?;
            let response = client.create_container(tonic::Request::new(req)).await?;
            return Ok::<String, Error>(response.into_inner().container_id);
        })
        .await;

        match ret {
            Err(_) => {
                return Err(Error::NodeRpcFailed(format!(
                    "CreateContainer timeout on node {}",
                    self.nodeId
                )));
            }
            Ok(Err(e)) => {
                return Err(Error::NodeRpcFailed(format!(
                    "CreateContainer fail on node {} with error {:?}",
                    self.nodeId, e
                )));
            }
            Ok(Ok(containerId)) => return Ok(containerId),
        }
    }

    // node level memory/cpu stats, off the placement path. kept as the
    // calibration hook for reserve-time memory reconciliation.
    pub async fn GetStats(&self, timeout: Duration) -> Result<ns::GetStatsReply> {
        let addr = self.SvcAddr();
        let ret = time::timeout(timeout, async move {
            let mut client = ns::node_service_client::NodeServiceClient::connect(addr).await?;
            let response = client
                .get_stats(tonic::Request::new(ns::GetStatsRequest {
                    request_id: "".to_owned(),
                }))
                .await?;
            return Ok::<ns::GetStatsReply, Error>(response.into_inner());
        })
        .await;

        match ret {
            Err(_) => {
                return Err(Error::NodeRpcFailed(format!(
                    "GetStats timeout on node {}",
                    self.nodeId
                )));
            }
            Ok(Err(e)) => {
                return Err(Error::NodeRpcFailed(format!(
                    "GetStats fail on node {} with error {:?}",
                    self.nodeId, e
                )));
            }
            Ok(Ok(reply)) => return Ok(reply),
        }
    }
}
