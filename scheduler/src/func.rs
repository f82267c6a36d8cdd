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
use std::ops::Deref;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex as TMutex;
use tokio::time;

use crate::container::ContainerHandle;

// capacity of the per-function idle hand-off channel
pub const IDLE_CHANN_SIZE: usize = 300;

// containers of one function on one node, numbered densely in creation order
#[derive(Debug)]
pub struct ContainerBucketInner {
    pub containers: Mutex<BTreeMap<u64, ContainerHandle>>,
    pub nextContainerNo: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ContainerBucket(Arc<ContainerBucketInner>);

impl Deref for ContainerBucket {
    type Target = Arc<ContainerBucketInner>;

    fn deref(&self) -> &Arc<ContainerBucketInner> {
        &self.0
    }
}

impl ContainerBucket {
    pub fn New() -> Self {
        let inner = ContainerBucketInner {
            containers: Mutex::new(BTreeMap::new()),
            nextContainerNo: AtomicU64::new(0),
        };

        return Self(Arc::new(inner));
    }

    pub fn NextContainerNo(&self) -> u64 {
        return self.nextContainerNo.fetch_add(1, Ordering::AcqRel) + 1;
    }

    pub fn Insert(&self, container: &ContainerHandle) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.containerNo, container.clone());
    }

    pub fn ContainerCount(&self) -> usize {
        return self.containers.lock().unwrap().len();
    }
}

#[derive(Debug)]
pub struct FunctionStateInner {
    pub functionName: String,
    // memory requirement from the first request's config, immutable
    pub declaredMemory: i64,
    // bytes charged per invocation, 0 until the function's first acquire.
    // seam for adaptive sizing, today always set to declaredMemory.
    pub computedMemory: AtomicI64,

    // nodeNo -> containers of this function on that node
    pub nodeContainerIndex: Mutex<BTreeMap<u64, ContainerBucket>>,

    pub idleTx: mpsc::Sender<ContainerHandle>,
    pub idleRx: TMutex<mpsc::Receiver<ContainerHandle>>,
}

#[derive(Debug, Clone)]
pub struct FunctionState(Arc<FunctionStateInner>);

impl Deref for FunctionState {
    type Target = Arc<FunctionStateInner>;

    fn deref(&self) -> &Arc<FunctionStateInner> {
        &self.0
    }
}

impl FunctionState {
    pub fn New(functionName: &str, declaredMemory: i64) -> Self {
        let (tx, rx) = mpsc::channel(IDLE_CHANN_SIZE);
        let inner = FunctionStateInner {
            functionName: functionName.to_owned(),
            declaredMemory: declaredMemory,
            computedMemory: AtomicI64::new(0),
            nodeContainerIndex: Mutex::new(BTreeMap::new()),
            idleTx: tx,
            idleRx: TMutex::new(rx),
        };

        return Self(Arc::new(inner));
    }

    pub fn ComputedMemory(&self) -> i64 {
        return self.computedMemory.load(Ordering::SeqCst);
    }

    pub fn SetComputedMemory(&self, memory: i64) {
        self.computedMemory.store(memory, Ordering::SeqCst);
    }

    pub fn GetBucket(&self, nodeNo: u64) -> Option<ContainerBucket> {
        return self.nodeContainerIndex.lock().unwrap().get(&nodeNo).cloned();
    }

    pub fn GetOrCreateBucket(&self, nodeNo: u64) -> ContainerBucket {
        let mut index = self.nodeContainerIndex.lock().unwrap();
        match index.get(&nodeNo) {
            Some(bucket) => return bucket.clone(),
            None => {
                let bucket = ContainerBucket::New();
                index.insert(nodeNo, bucket.clone());
                return bucket;
            }
        }
    }

    // offer a just-returned container to waiting acquires. sendCount keeps a
    // container from being queued twice; a full channel drops the hand-off
    // and the container stays discoverable through nodeContainerIndex.
    pub async fn PublishIdle(&self, container: &ContainerHandle, timeout: Duration) {
        if container.SendCount() > 0 {
            return;
        }

        container.MarkQueued();
        match self
            .idleTx
            .send_timeout(container.clone(), timeout)
            .await
        {
            Ok(()) => (),
            Err(_) => {
                container.MarkDequeued();
            }
        }
    }

    // timed receive; decrements sendCount exactly on receive
    pub async fn TryDequeueIdle(&self, timeout: Duration) -> Option<ContainerHandle> {
        let ret = time::timeout(timeout, async {
            let mut rx = self.idleRx.lock().await;
            return rx.recv().await;
        })
        .await;

        match ret {
            Err(_) => return None,
            Ok(None) => return None,
            Ok(Some(container)) => {
                container.MarkDequeued();
                return Some(container);
            }
        }
    }
}
