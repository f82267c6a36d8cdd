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
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time;
use uuid::Uuid;

use fshare::common::*;
use fshare::config::SchedulerConfig;
use fshare::ns;
use fshare::rm;
use fshare::sched;

use crate::container::ContainerHandle;
use crate::func::FunctionState;
use crate::message::ResponseInfo;
use crate::node::NodeHandle;

// capacity of the global return channel
pub const RETURN_CHANN_SIZE: usize = 1000;
// backoff before surfacing a resource manager failure
pub const RM_BACKOFF: Duration = Duration::from_millis(100);

pub fn LatencyMs(start: &SystemTime) -> i64 {
    match start.elapsed() {
        Ok(d) => return d.as_millis() as i64,
        Err(_) => return 0,
    }
}

#[derive(Debug)]
pub struct RequestStatusInner {
    pub functionName: String,
    pub nodeAddress: String,
    pub containerId: String,

    // bytes
    pub requireMemory: i64,
    pub actualRequireMemory: i64,
    pub maxMemoryUsage: AtomicI64,

    // ms
    pub scheduleAcquireLatency: AtomicI64,
    pub scheduleReturnLatency: AtomicI64,
    pub functionExecutionDuration: AtomicI64,
    pub responseTime: AtomicI64,

    pub functionTimeout: i64,

    // back references, non-owning
    pub container: ContainerHandle,
    pub function: FunctionState,
}

#[derive(Debug, Clone)]
pub struct RequestStatus(Arc<RequestStatusInner>);

impl Deref for RequestStatus {
    type Target = Arc<RequestStatusInner>;

    fn deref(&self) -> &Arc<RequestStatusInner> {
        &self.0
    }
}

#[derive(Serialize)]
struct RequestStatusDump<'a> {
    functionName: &'a str,
    nodeAddress: &'a str,
    containerId: &'a str,
    requireMemory: i64,
    actualRequireMemory: i64,
    maxMemoryUsage: i64,
    scheduleAcquireLatency: i64,
    scheduleReturnLatency: i64,
    functionExecutionDuration: i64,
    responseTime: i64,
    functionTimeout: i64,
}

impl RequestStatus {
    pub fn New(
        req: &sched::AcquireContainerRequest,
        fnConfig: &sched::FunctionConfig,
        container: &ContainerHandle,
        function: &FunctionState,
        actualRequireMemory: i64,
    ) -> Self {
        let inner = RequestStatusInner {
            functionName: req.function_name.clone(),
            nodeAddress: container.node.address.clone(),
            containerId: container.containerId.clone(),
            requireMemory: fnConfig.memory_in_bytes,
            actualRequireMemory: actualRequireMemory,
            maxMemoryUsage: AtomicI64::new(0),
            scheduleAcquireLatency: AtomicI64::new(0),
            scheduleReturnLatency: AtomicI64::new(0),
            functionExecutionDuration: AtomicI64::new(0),
            responseTime: AtomicI64::new(0),
            functionTimeout: fnConfig.timeout_in_ms,
            container: container.clone(),
            function: function.clone(),
        };

        return Self(Arc::new(inner));
    }

    pub fn ToJson(&self) -> String {
        let dump = RequestStatusDump {
            functionName: &self.functionName,
            nodeAddress: &self.nodeAddress,
            containerId: &self.containerId,
            requireMemory: self.requireMemory,
            actualRequireMemory: self.actualRequireMemory,
            maxMemoryUsage: self.maxMemoryUsage.load(Ordering::SeqCst),
            scheduleAcquireLatency: self.scheduleAcquireLatency.load(Ordering::SeqCst),
            scheduleReturnLatency: self.scheduleReturnLatency.load(Ordering::SeqCst),
            functionExecutionDuration: self.functionExecutionDuration.load(Ordering::SeqCst),
            responseTime: self.responseTime.load(Ordering::SeqCst),
            functionTimeout: self.functionTimeout,
        };

        match serde_json::to_string_pretty(&dump) {
            Ok(data) => return data,
            Err(_) => return "{}".to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct RouterInner {
    pub config: SchedulerConfig,

    // nodeNo -> node; the BTreeMap keeps scans in ascending nodeNo order
    pub nodes: Mutex<BTreeMap<u64, NodeHandle>>,
    pub nextNodeNo: AtomicU64,

    pub functions: Mutex<BTreeMap<String, FunctionState>>,
    pub requests: Mutex<BTreeMap<String, RequestStatus>>,

    pub returnTx: mpsc::Sender<ResponseInfo>,
    pub returnRx: Mutex<Option<mpsc::Receiver<ResponseInfo>>>,

    pub closeNotify: Arc<Notify>,
    pub stop: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct Router(Arc<RouterInner>);

impl Deref for Router {
    type Target = Arc<RouterInner>;

    fn deref(&self) -> &Arc<RouterInner> {
        &self.0
    }
}

impl Router {
    pub fn New(config: &SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::channel(RETURN_CHANN_SIZE);
        let inner = RouterInner {
            config: config.clone(),
            nodes: Mutex::new(BTreeMap::new()),
            nextNodeNo: AtomicU64::new(0),
            functions: Mutex::new(BTreeMap::new()),
            requests: Mutex::new(BTreeMap::new()),
            returnTx: tx,
            returnRx: Mutex::new(Some(rx)),
            closeNotify: Arc::new(Notify::new()),
            stop: AtomicBool::new(false),
        };

        return Self(Arc::new(inner));
    }

    pub fn Close(&self) {
        self.closeNotify.notify_waiters();
    }

    pub fn NodeCount(&self) -> usize {
        return self.nodes.lock().unwrap().len();
    }

    pub fn GetRequest(&self, requestId: &str) -> Option<RequestStatus> {
        return self.requests.lock().unwrap().get(requestId).cloned();
    }

    pub fn SetAcquireLatency(&self, requestId: &str, latency: i64) {
        match self.requests.lock().unwrap().get(requestId) {
            None => (),
            Some(status) => {
                status
                    .scheduleAcquireLatency
                    .store(latency, Ordering::SeqCst);
            }
        }
    }

    // insert-if-absent; the first caller's declared memory wins
    pub fn GetOrCreateFunction(&self, name: &str, declaredMemory: i64) -> FunctionState {
        let mut functions = self.functions.lock().unwrap();
        match functions.get(name) {
            Some(func) => return func.clone(),
            None => {
                let func = FunctionState::New(name, declaredMemory);
                functions.insert(name.to_owned(), func.clone());
                return func;
            }
        }
    }

    pub async fn AcquireContainer(
        &self,
        req: &sched::AcquireContainerRequest,
    ) -> Result<sched::AcquireContainerReply> {
        let fnConfig = match &req.function_config {
            None => {
                return Err(Error::InvalidArgument(
                    "function config cannot be none".to_owned(),
                ));
            }
            Some(config) => config,
        };

        let func = self.GetOrCreateFunction(&req.function_name, fnConfig.memory_in_bytes);

        let mut requireMemory = func.ComputedMemory();
        let mut candidate: Option<ContainerHandle> = None;
        // a freshly created container already carries this request's charge
        let mut fresh = false;
        let mut lastErr: Option<Error> = None;

        if requireMemory == 0 {
            // first touch: no warm container can exist yet, create directly
            requireMemory = fnConfig.memory_in_bytes;
            func.SetComputedMemory(requireMemory);
            match self.CreateNewContainer(req, &func, requireMemory).await {
                Ok(container) => {
                    candidate = Some(container);
                    fresh = true;
                }
                Err(e) => {
                    warn!(
                        "request id: {}, first create container error: {:?}",
                        &req.request_id, &e
                    );
                    lastErr = Some(e);
                }
            }
        } else {
            match func.TryDequeueIdle(self.config.ChannelTimeout()).await {
                Some(container) => {
                    info!("request id: {}, use idle container", &req.request_id);
                    candidate = Some(container);
                }
                None => (),
            }
        }

        if candidate.is_none() {
            candidate = self.GetAvailableContainer(&func, requireMemory);
        }

        if candidate.is_none() {
            match self.CreateNewContainer(req, &func, requireMemory).await {
                Ok(container) => {
                    candidate = Some(container);
                    fresh = true;
                }
                Err(e) => {
                    warn!(
                        "request id: {}, create container error: {:?}",
                        &req.request_id, &e
                    );
                    lastErr = Some(e);
                    // last chance: a concurrent return may still hand one off
                    candidate = func.TryDequeueIdle(self.config.WaitChannelTimeout()).await;
                }
            }
        }

        let container = match candidate {
            Some(container) => container,
            None => match lastErr {
                Some(e) => return Err(e),
                None => {
                    return Err(Error::AcquireTimeout(format!(
                        "no container available for function {}",
                        &req.function_name
                    )));
                }
            },
        };

        if !fresh {
            container.Charge(&req.request_id, requireMemory);
        }

        let status = RequestStatus::New(req, fnConfig, &container, &func, requireMemory);
        self.requests
            .lock()
            .unwrap()
            .insert(req.request_id.clone(), status);

        return Ok(sched::AcquireContainerReply {
            node_id: container.node.nodeId.clone(),
            node_address: container.node.address.clone(),
            node_service_port: container.node.port,
            container_id: container.containerId.clone(),
        });
    }

    // enqueue a completion report for the return pipeline. the report is
    // dropped when the channel stays full past the timeout; the ack is
    // returned either way.
    pub async fn ReturnContainer(&self, resp: ResponseInfo) -> Result<()> {
        let requestId = resp.requestId.clone();
        match self
            .returnTx
            .send_timeout(resp, self.config.ChannelTimeout())
            .await
        {
            Ok(()) => (),
            Err(e) => {
                warn!(
                    "request id: {}, ReturnContainer enqueue fail: {:?}",
                    &requestId,
                    Error::from(e)
                );
            }
        }
        return Ok(());
    }

    async fn CreateNewContainer(
        &self,
        req: &sched::AcquireContainerRequest,
        func: &FunctionState,
        requireMemory: i64,
    ) -> Result<ContainerHandle> {
        let fnConfig = match &req.function_config {
            None => {
                return Err(Error::InvalidArgument(
                    "function config cannot be none".to_owned(),
                ));
            }
            Some(config) => config,
        };

        let node = self.GetNode(&req.request_id, fnConfig.memory_in_bytes).await?;

        // speculative charge; must be rolled back if the create rpc fails
        node.ChargeMemory(&req.request_id, fnConfig.memory_in_bytes);

        let createReq = ns::CreateContainerRequest {
            name: format!("{}{}", &req.function_name, Uuid::new_v4()),
            function_meta: Some(ns::FunctionMeta {
                function_name: req.function_name.clone(),
                handler: fnConfig.handler.clone(),
                timeout_in_ms: fnConfig.timeout_in_ms,
                memory_in_bytes: fnConfig.memory_in_bytes,
            }),
            request_id: req.request_id.clone(),
        };

        let start = SystemTime::now();
        let containerId = match node.CreateContainer(createReq, self.config.Timeout()).await {
            Err(e) => {
                node.RollbackMemory(&req.request_id, fnConfig.memory_in_bytes);
                return Err(e);
            }
            Ok(containerId) => containerId,
        };
        info!(
            "{} CreateContainer, latency: {}",
            &req.function_name,
            LatencyMs(&start)
        );

        let bucket = func.GetOrCreateBucket(node.nodeNo);
        let containerNo = bucket.NextContainerNo();
        let container =
            ContainerHandle::New(&containerId, &node, containerNo, fnConfig.memory_in_bytes);
        // the new container carries its first request's charge from birth
        container.Charge(&req.request_id, requireMemory);
        node.InsertContainer(&containerId);
        bucket.Insert(&container);

        info!(
            "request id: {}, created container {} on node {}",
            &req.request_id, &containerId, &node.nodeId
        );

        return Ok(container);
    }

    async fn GetNode(&self, requestId: &str, memory: i64) -> Result<NodeHandle> {
        match self.GetAvailableNode(memory) {
            Some(node) => {
                info!("request id: {}, use exist node: {}", requestId, &node.nodeId);
                return Ok(node);
            }
            None => (),
        }

        // best effort cap check; concurrent reservers may overshoot by one
        if self.NodeCount() >= self.config.maxNodeNum {
            return Err(Error::NodeLimitReached);
        }

        return self.ReserveNode().await;
    }

    // first node with strictly more memory than requested, in ascending
    // nodeNo order so load packs onto the oldest nodes
    fn GetAvailableNode(&self, memory: i64) -> Option<NodeHandle> {
        let nodes = self.nodes.lock().unwrap();
        for (_, node) in nodes.iter() {
            if node.AvailableMemory() > memory {
                return Some(node.clone());
            }
        }
        return None;
    }

    async fn ReserveNode(&self) -> Result<NodeHandle> {
        let start = SystemTime::now();
        let rmAddr = self.config.rmAddr.clone();
        let ret = time::timeout(self.config.Timeout(), async move {
            let mut client =
                rm::resource_manager_service_client::ResourceManagerServiceClient::connect(rmAddr)
                    .await?;
            let response = client
                .reserve_node(tonic::Request::new(rm::ReserveNodeRequest {
                    account_id: "".to_owned(),
                }))
                .await?;
            return Ok::<rm::ReserveNodeReply, Error>(response.into_inner());
        })
        .await;

        let reply = match ret {
            Err(_) => {
                error!("ReserveNode timeout, latency: {}", LatencyMs(&start));
                time::sleep(RM_BACKOFF).await;
                return Err(Error::RmRpcFailed("ReserveNode timeout".to_owned()));
            }
            Ok(Err(e)) => {
                error!(
                    "ReserveNode fail with error {:?}, latency: {}",
                    &e,
                    LatencyMs(&start)
                );
                time::sleep(RM_BACKOFF).await;
                return Err(Error::RmRpcFailed(format!(
                    "ReserveNode fail with error {:?}",
                    e
                )));
            }
            Ok(Ok(reply)) => reply,
        };

        let desc = match reply.node {
            None => {
                time::sleep(RM_BACKOFF).await;
                return Err(Error::RmRpcFailed("ReserveNode returned no node".to_owned()));
            }
            Some(desc) => desc,
        };

        let node = {
            // dense numbering assigned under the map lock so scans and the
            // counter agree on reservation order
            let mut nodes = self.nodes.lock().unwrap();
            let nodeNo = self.nextNodeNo.fetch_add(1, Ordering::AcqRel) + 1;
            let node = NodeHandle::New(
                &desc.id,
                nodeNo,
                &desc.address,
                desc.node_service_port,
                desc.memory_in_bytes,
            );
            nodes.insert(nodeNo, node.clone());
            node
        };

        info!(
            "ReserveNode id: {}, no: {}, memory: {}, latency: {}",
            &node.nodeId,
            node.nodeNo,
            node.totalMemory,
            LatencyMs(&start)
        );

        // reserve-time reconciliation against GetStats stays disabled
        // let stats = node.GetStats(self.config.Timeout()).await?;

        return Ok(node);
    }

    // deterministic warm scan: ascending nodeNo, then ascending containerNo.
    // concurrent arrivals of one function collide on the oldest container
    // first, which is the packing objective.
    fn GetAvailableContainer(
        &self,
        func: &FunctionState,
        requireMemory: i64,
    ) -> Option<ContainerHandle> {
        let nodes = self.nodes.lock().unwrap();
        for nodeNo in nodes.keys() {
            let bucket = match func.GetBucket(*nodeNo) {
                None => continue,
                Some(bucket) => bucket,
            };

            let containers = bucket.containers.lock().unwrap();
            for (_, container) in containers.iter() {
                if container.AvailableMemory() >= requireMemory {
                    return Some(container.clone());
                }
            }
        }
        return None;
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use std::result::Result as SResult;

    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    use fshare::ns::node_service_server::NodeService;
    use fshare::ns::node_service_server::NodeServiceServer;
    use fshare::rm::resource_manager_service_server::ResourceManagerService;
    use fshare::rm::resource_manager_service_server::ResourceManagerServiceServer;

    #[derive(Debug, Default)]
    pub struct MockState {
        pub reserveCalls: AtomicI64,
        pub createCalls: AtomicI64,
        pub nextNodeId: AtomicI64,
        pub nextContainerId: AtomicI64,
        pub failReserve: AtomicBool,
        pub failCreate: AtomicBool,
        pub nodeMemory: AtomicI64,
        pub nodeSvcPort: AtomicI64,
    }

    #[derive(Debug, Clone)]
    struct MockRm {
        state: Arc<MockState>,
    }

    #[tonic::async_trait]
    impl ResourceManagerService for MockRm {
        async fn reserve_node(
            &self,
            _request: tonic::Request<rm::ReserveNodeRequest>,
        ) -> SResult<tonic::Response<rm::ReserveNodeReply>, tonic::Status> {
            self.state.reserveCalls.fetch_add(1, Ordering::SeqCst);
            if self.state.failReserve.load(Ordering::SeqCst) {
                return Err(tonic::Status::unavailable("no node available"));
            }

            let no = self.state.nextNodeId.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(tonic::Response::new(rm::ReserveNodeReply {
                node: Some(rm::NodeDesc {
                    id: format!("node-{}", no),
                    address: "127.0.0.1".to_owned(),
                    node_service_port: self.state.nodeSvcPort.load(Ordering::SeqCst) as i32,
                    memory_in_bytes: self.state.nodeMemory.load(Ordering::SeqCst),
                }),
            }));
        }
    }

    #[derive(Debug, Clone)]
    struct MockNodeSvc {
        state: Arc<MockState>,
    }

    #[tonic::async_trait]
    impl NodeService for MockNodeSvc {
        async fn create_container(
            &self,
            _request: tonic::Request<ns::CreateContainerRequest>,
        ) -> SResult<tonic::Response<ns::CreateContainerReply>, tonic::Status> {
            self.state.createCalls.fetch_add(1, Ordering::SeqCst);
            if self.state.failCreate.load(Ordering::SeqCst) {
                return Err(tonic::Status::internal("create container fail"));
            }

            let no = self.state.nextContainerId.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(tonic::Response::new(ns::CreateContainerReply {
                container_id: format!("container-{}", no),
            }));
        }

        async fn get_stats(
            &self,
            _request: tonic::Request<ns::GetStatsRequest>,
        ) -> SResult<tonic::Response<ns::GetStatsReply>, tonic::Status> {
            return Ok(tonic::Response::new(ns::GetStatsReply {
                node_stats: Some(ns::NodeStats {
                    total_memory_in_bytes: self.state.nodeMemory.load(Ordering::SeqCst),
                    available_memory_in_bytes: self.state.nodeMemory.load(Ordering::SeqCst),
                    cpu_usage_pct: 0.0,
                }),
                container_stats: Vec::new(),
            }));
        }
    }

    // one mock resource manager plus one mock node service on ephemeral
    // loopback ports; every reserved node points at the same node service.
    pub async fn StartMockCluster(state: &Arc<MockState>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let nsPort = listener.local_addr().unwrap().port();
        state.nodeSvcPort.store(nsPort as i64, Ordering::SeqCst);
        let nodeSvc = MockNodeSvc {
            state: state.clone(),
        };
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(NodeServiceServer::new(nodeSvc))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .ok();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rmPort = listener.local_addr().unwrap().port();
        let rmSvc = MockRm {
            state: state.clone(),
        };
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(ResourceManagerServiceServer::new(rmSvc))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .ok();
        });

        return format!("http://127.0.0.1:{}", rmPort);
    }

    pub fn TestConfig(rmAddr: &str, maxNodeNum: usize) -> SchedulerConfig {
        return SchedulerConfig {
            maxNodeNum: maxNodeNum,
            timeoutMs: 1000,
            channelTimeoutMs: 20,
            waitChannelTimeoutMs: 100,
            rmAddr: rmAddr.to_owned(),
            svcPort: 0,
        };
    }

    pub fn AcquireReq(
        requestId: &str,
        functionName: &str,
        memory: i64,
    ) -> sched::AcquireContainerRequest {
        return sched::AcquireContainerRequest {
            request_id: requestId.to_owned(),
            account_id: "account-1".to_owned(),
            function_name: functionName.to_owned(),
            function_config: Some(sched::FunctionConfig {
                handler: "index.handler".to_owned(),
                timeout_in_ms: 3000,
                memory_in_bytes: memory,
            }),
        };
    }

    fn GetNodeByNo(router: &Router, nodeNo: u64) -> NodeHandle {
        return router.nodes.lock().unwrap().get(&nodeNo).unwrap().clone();
    }

    async fn WaitRequestGone(router: &Router, requestId: &str) {
        for _ in 0..100 {
            if router.GetRequest(requestId).is_none() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {} still pending", requestId);
    }

    #[tokio::test]
    async fn TestColdStartSingleRequest() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let reply = router
            .AcquireContainer(&AcquireReq("r1", "f1", 128))
            .await
            .unwrap();

        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);
        assert_eq!(state.createCalls.load(Ordering::SeqCst), 1);
        assert_eq!(reply.node_id, "node-1");
        assert_eq!(reply.container_id, "container-1");
        assert_eq!(reply.node_address, "127.0.0.1");

        let node = GetNodeByNo(&router, 1);
        assert_eq!(node.AvailableMemory(), 1024 - 128);
        assert!(node.HasRequest("r1"));
        assert_eq!(node.ContainerCount(), 1);

        let status = router.GetRequest("r1").unwrap();
        assert_eq!(status.container.AvailableMemory(), 0);
        assert!(status.container.HasRequest("r1"));
        assert_eq!(status.actualRequireMemory, 128);
    }

    #[tokio::test]
    async fn TestWarmHitAfterReturn() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let processor = router.clone();
        tokio::spawn(async move {
            processor.Process().await.ok();
        });

        let reply1 = router
            .AcquireContainer(&AcquireReq("r1", "f1", 128))
            .await
            .unwrap();

        router
            .ReturnContainer(ResponseInfo {
                requestId: "r1".to_owned(),
                containerId: reply1.container_id.clone(),
                maxMemoryUsageInBytes: 100 * 1024,
                durationInMs: 5,
                enqueueTime: SystemTime::now(),
            })
            .await
            .unwrap();
        WaitRequestGone(&router, "r1").await;

        let node = GetNodeByNo(&router, 1);
        assert_eq!(node.AvailableMemory(), 1024);
        assert_eq!(node.RequestCount(), 0);

        let reply2 = router
            .AcquireContainer(&AcquireReq("r2", "f1", 128))
            .await
            .unwrap();

        // same warm container, no further upstream rpc
        assert_eq!(reply2.container_id, reply1.container_id);
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);
        assert_eq!(state.createCalls.load(Ordering::SeqCst), 1);

        let status = router.GetRequest("r2").unwrap();
        assert_eq!(status.container.AvailableMemory(), 0);
        assert!(status.container.HasRequest("r2"));
        assert!(!status.container.HasRequest("r1"));

        router.Close();
    }

    #[tokio::test]
    async fn TestWarmScanFallback() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let processor = router.clone();
        tokio::spawn(async move {
            processor.Process().await.ok();
        });

        let reply1 = router
            .AcquireContainer(&AcquireReq("r1", "f1", 128))
            .await
            .unwrap();
        router
            .ReturnContainer(ResponseInfo {
                requestId: "r1".to_owned(),
                containerId: reply1.container_id.clone(),
                maxMemoryUsageInBytes: 64,
                durationInMs: 1,
                enqueueTime: SystemTime::now(),
            })
            .await
            .unwrap();
        WaitRequestGone(&router, "r1").await;

        // drain the hand-off so the next acquire misses the idle channel and
        // must find the container through the warm scan
        let func = router.GetOrCreateFunction("f1", 128);
        let drained = func.TryDequeueIdle(Duration::from_millis(20)).await;
        assert!(drained.is_some());

        let reply2 = router
            .AcquireContainer(&AcquireReq("r2", "f1", 128))
            .await
            .unwrap();

        assert_eq!(reply2.container_id, reply1.container_id);
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);
        assert_eq!(state.createCalls.load(Ordering::SeqCst), 1);

        router.Close();
    }

    #[tokio::test]
    async fn TestPackOntoExistingNode() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let reply1 = router
            .AcquireContainer(&AcquireReq("r1", "f1", 128))
            .await
            .unwrap();
        // no return in between: the first container is fully charged, so the
        // warm scan misses and a second container lands on the same node
        let reply2 = router
            .AcquireContainer(&AcquireReq("r2", "f1", 128))
            .await
            .unwrap();

        assert_eq!(reply2.node_id, reply1.node_id);
        assert_ne!(reply2.container_id, reply1.container_id);
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);
        assert_eq!(state.createCalls.load(Ordering::SeqCst), 2);

        let node = GetNodeByNo(&router, 1);
        assert_eq!(node.AvailableMemory(), 1024 - 2 * 128);
        assert_eq!(node.ContainerCount(), 2);
    }

    #[tokio::test]
    async fn TestOverflowTriggersNewNode() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        // fill node 1 down to 128 free
        for i in 0..7 {
            router
                .AcquireContainer(&AcquireReq(&format!("r{}", i), "f1", 128))
                .await
                .unwrap();
        }
        let node1 = GetNodeByNo(&router, 1);
        assert_eq!(node1.AvailableMemory(), 1024 - 7 * 128);
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);

        // 128 free is not strictly more than 256, so a new node is reserved
        let reply = router
            .AcquireContainer(&AcquireReq("r8", "f2", 256))
            .await
            .unwrap();

        assert_eq!(reply.node_id, "node-2");
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 2);
        assert_eq!(router.NodeCount(), 2);

        let node2 = GetNodeByNo(&router, 2);
        assert_eq!(node2.AvailableMemory(), 1024 - 256);
    }

    #[tokio::test]
    async fn TestCreateFailureRollsBack() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        state.failCreate.store(true, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let ret = router.AcquireContainer(&AcquireReq("r1", "f1", 128)).await;
        match ret {
            Err(Error::NodeRpcFailed(_)) => (),
            r => panic!("expected NodeRpcFailed, got {:?}", r),
        }

        // the speculative charge is fully rolled back
        let node = GetNodeByNo(&router, 1);
        assert_eq!(node.AvailableMemory(), 1024);
        assert_eq!(node.RequestCount(), 0);
        assert_eq!(node.ContainerCount(), 0);
        assert!(router.GetRequest("r1").is_none());
    }

    #[tokio::test]
    async fn TestNodeLimitReached() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(256, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 1));

        router
            .AcquireContainer(&AcquireReq("r1", "f1", 128))
            .await
            .unwrap();

        let ret = router.AcquireContainer(&AcquireReq("r2", "f2", 256)).await;
        match ret {
            Err(Error::NodeLimitReached) => (),
            r => panic!("expected NodeLimitReached, got {:?}", r),
        }
        assert_eq!(state.reserveCalls.load(Ordering::SeqCst), 1);
        assert_eq!(router.NodeCount(), 1);
    }

    #[tokio::test]
    async fn TestRmFailureBackoff() {
        let state = Arc::new(MockState::default());
        state.failReserve.store(true, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let start = SystemTime::now();
        let ret = router.AcquireContainer(&AcquireReq("r1", "f1", 128)).await;
        match ret {
            Err(Error::RmRpcFailed(_)) => (),
            r => panic!("expected RmRpcFailed, got {:?}", r),
        }
        // both creation attempts back off before surfacing
        assert!(LatencyMs(&start) >= 2 * RM_BACKOFF.as_millis() as i64);
        assert_eq!(router.NodeCount(), 0);
    }

    #[tokio::test]
    async fn TestScanOrderDeterministic() {
        let config = TestConfig("http://127.0.0.1:1", 4);
        let router = Router::New(&config);
        let func = router.GetOrCreateFunction("f1", 128);

        // two nodes, two containers each, all with room
        for nodeNo in 1..=2u64 {
            let node = NodeHandle::New(
                &format!("node-{}", nodeNo),
                nodeNo,
                "127.0.0.1",
                10501,
                1024,
            );
            router.nodes.lock().unwrap().insert(nodeNo, node.clone());
            let bucket = func.GetOrCreateBucket(nodeNo);
            for _ in 0..2 {
                let containerNo = bucket.NextContainerNo();
                let container = ContainerHandle::New(
                    &format!("container-{}-{}", nodeNo, containerNo),
                    &node,
                    containerNo,
                    128,
                );
                bucket.Insert(&container);
            }
        }

        let first = router.GetAvailableContainer(&func, 128).unwrap();
        assert_eq!(first.containerId, "container-1-1");

        // exhaust (1,1): the scan moves to (1,2), then node 2
        first.Charge("r1", 128);
        let second = router.GetAvailableContainer(&func, 128).unwrap();
        assert_eq!(second.containerId, "container-1-2");

        second.Charge("r2", 128);
        let third = router.GetAvailableContainer(&func, 128).unwrap();
        assert_eq!(third.containerId, "container-2-1");
    }

    #[tokio::test]
    async fn TestFunctionCreationIdempotent() {
        let config = TestConfig("http://127.0.0.1:1", 4);
        let router = Router::New(&config);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = router.clone();
            handles.push(tokio::spawn(async move {
                return r.GetOrCreateFunction("f1", 128);
            }));
        }

        let first = router.GetOrCreateFunction("f1", 128);
        for h in handles {
            let func = h.await.unwrap();
            assert!(Arc::ptr_eq(&func, &first));
        }
        assert_eq!(router.functions.lock().unwrap().len(), 1);

        // a later caller's declared memory is ignored
        let again = router.GetOrCreateFunction("f1", 999);
        assert_eq!(again.declaredMemory, 128);
    }

    #[tokio::test]
    async fn TestMemoryConservation() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let processor = router.clone();
        tokio::spawn(async move {
            processor.Process().await.ok();
        });

        for i in 0..4 {
            router
                .AcquireContainer(&AcquireReq(&format!("r{}", i), "f1", 128))
                .await
                .unwrap();
        }

        let node = GetNodeByNo(&router, 1);
        let mut charged = 0;
        for (_, amount) in node.requests.lock().unwrap().iter() {
            charged += amount;
        }
        assert_eq!(node.AvailableMemory(), node.totalMemory - charged);

        for i in 0..4 {
            router
                .ReturnContainer(ResponseInfo {
                    requestId: format!("r{}", i),
                    containerId: format!("container-{}", i + 1),
                    maxMemoryUsageInBytes: 64,
                    durationInMs: 1,
                    enqueueTime: SystemTime::now(),
                })
                .await
                .unwrap();
        }
        for i in 0..4 {
            WaitRequestGone(&router, &format!("r{}", i)).await;
        }

        // all charges released at quiescence
        assert_eq!(node.AvailableMemory(), node.totalMemory);
        assert_eq!(node.RequestCount(), 0);
        assert!(router.requests.lock().unwrap().is_empty());

        router.Close();
    }

    #[tokio::test]
    async fn TestUnknownReturnDropped() {
        let state = Arc::new(MockState::default());
        state.nodeMemory.store(1024, Ordering::SeqCst);
        let rmAddr = StartMockCluster(&state).await;
        let router = Router::New(&TestConfig(&rmAddr, 4));

        let processor = router.clone();
        tokio::spawn(async move {
            processor.Process().await.ok();
        });

        router
            .ReturnContainer(ResponseInfo {
                requestId: "no-such-request".to_owned(),
                containerId: "no-such-container".to_owned(),
                maxMemoryUsageInBytes: 0,
                durationInMs: 0,
                enqueueTime: SystemTime::now(),
            })
            .await
            .unwrap();

        // the report is consumed without touching any state
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.NodeCount(), 0);
        assert!(router.requests.lock().unwrap().is_empty());

        router.Close();
    }
}
