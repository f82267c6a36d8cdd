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
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::node::NodeHandle;

#[derive(Debug)]
pub struct ContainerHandleInner {
    pub containerId: String,
    // back reference to the hosting node, non-owning
    pub node: NodeHandle,
    // dense within the function x node bucket
    pub containerNo: u64,

    pub availableMemory: AtomicI64,
    // request_id -> charged bytes
    pub requests: Mutex<BTreeMap<String, i64>>,
    // pending hand-offs queued in the function's idle channel
    pub sendCount: AtomicI32,
}

#[derive(Debug, Clone)]
pub struct ContainerHandle(Arc<ContainerHandleInner>);

impl Deref for ContainerHandle {
    type Target = Arc<ContainerHandleInner>;

    fn deref(&self) -> &Arc<ContainerHandleInner> {
        &self.0
    }
}

impl ContainerHandle {
    pub fn New(containerId: &str, node: &NodeHandle, containerNo: u64, memory: i64) -> Self {
        let inner = ContainerHandleInner {
            containerId: containerId.to_owned(),
            node: node.clone(),
            containerNo: containerNo,
            availableMemory: AtomicI64::new(memory),
            requests: Mutex::new(BTreeMap::new()),
            sendCount: AtomicI32::new(0),
        };

        return Self(Arc::new(inner));
    }

    pub fn AvailableMemory(&self) -> i64 {
        return self.availableMemory.load(Ordering::SeqCst);
    }

    // charge and release are plain atomic add/sub. a losing race can drive
    // availableMemory transiently negative; the next Release corrects it.
    pub fn Charge(&self, requestId: &str, amount: i64) {
        self.availableMemory.fetch_sub(amount, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .insert(requestId.to_owned(), amount);
    }

    pub fn Release(&self, requestId: &str, amount: i64) {
        self.availableMemory.fetch_add(amount, Ordering::SeqCst);
        self.requests.lock().unwrap().remove(requestId);
    }

    pub fn RequestCount(&self) -> usize {
        return self.requests.lock().unwrap().len();
    }

    pub fn HasRequest(&self, requestId: &str) -> bool {
        return self.requests.lock().unwrap().contains_key(requestId);
    }

    pub fn SendCount(&self) -> i32 {
        return self.sendCount.load(Ordering::SeqCst);
    }

    pub fn MarkQueued(&self) {
        self.sendCount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn MarkDequeued(&self) {
        self.sendCount.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn TestNode() -> NodeHandle {
        return NodeHandle::New("node-1", 1, "127.0.0.1", 10501, 1024);
    }

    #[test]
    fn TestChargeRelease() {
        let node = TestNode();
        let container = ContainerHandle::New("container-1", &node, 1, 256);

        container.Charge("r1", 128);
        assert_eq!(container.AvailableMemory(), 128);
        assert!(container.HasRequest("r1"));

        container.Charge("r2", 128);
        assert_eq!(container.AvailableMemory(), 0);
        assert_eq!(container.RequestCount(), 2);

        container.Release("r1", 128);
        assert_eq!(container.AvailableMemory(), 128);
        assert!(!container.HasRequest("r1"));
        assert!(container.HasRequest("r2"));

        container.Release("r2", 128);
        assert_eq!(container.AvailableMemory(), 256);
        assert_eq!(container.RequestCount(), 0);
    }

    #[test]
    fn TestConcurrentCharge() {
        let node = TestNode();
        let container = ContainerHandle::New("container-1", &node, 1, 64 * 128);

        let mut handles = Vec::new();
        for i in 0..64 {
            let c = container.clone();
            handles.push(std::thread::spawn(move || {
                c.Charge(&format!("r{}", i), 128);
                c.Release(&format!("r{}", i), 128);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(container.AvailableMemory(), 64 * 128);
        assert_eq!(container.RequestCount(), 0);
    }

    #[test]
    fn TestQueueMarks() {
        let node = TestNode();
        let container = ContainerHandle::New("container-1", &node, 1, 128);

        assert_eq!(container.SendCount(), 0);
        container.MarkQueued();
        assert_eq!(container.SendCount(), 1);
        container.MarkDequeued();
        assert_eq!(container.SendCount(), 0);
    }
}
