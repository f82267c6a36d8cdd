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

use std::result::Result as SResult;
use std::time::SystemTime;

use tonic::transport::Server;

use fshare::common::*;
use fshare::sched;

use crate::message::ResponseInfo;
use crate::router::LatencyMs;
use crate::router::Router;
use crate::ROUTER;
use crate::SCHED_CONFIG;

pub struct SchedSvc {
    pub router: Router,
}

#[tonic::async_trait]
impl sched::scheduler_service_server::SchedulerService for SchedSvc {
    async fn acquire_container(
        &self,
        request: tonic::Request<sched::AcquireContainerRequest>,
    ) -> SResult<tonic::Response<sched::AcquireContainerReply>, tonic::Status> {
        let req = request.into_inner();
        if req.account_id.is_empty() {
            return Err(tonic::Status::invalid_argument("account id cannot be empty"));
        }
        if req.function_config.is_none() {
            return Err(tonic::Status::invalid_argument(
                "function config cannot be none",
            ));
        }

        info!(
            "request id: {}, request function name: {}",
            &req.request_id, &req.function_name
        );

        let start = SystemTime::now();
        match self.router.AcquireContainer(&req).await {
            Err(e) => {
                error!(
                    "request id: {}, AcquireContainer fail, latency: {}, error: {:?}",
                    &req.request_id,
                    LatencyMs(&start),
                    &e
                );
                return Err(e.ToStatus());
            }
            Ok(reply) => {
                let latency = LatencyMs(&start);
                info!(
                    "request id: {}, AcquireContainer, latency: {}",
                    &req.request_id, latency
                );
                self.router.SetAcquireLatency(&req.request_id, latency);
                return Ok(tonic::Response::new(reply));
            }
        }
    }

    async fn return_container(
        &self,
        request: tonic::Request<sched::ReturnContainerRequest>,
    ) -> SResult<tonic::Response<sched::ReturnContainerReply>, tonic::Status> {
        let req = request.into_inner();
        let resp = ResponseInfo::New(&req);
        match self.router.ReturnContainer(resp).await {
            Ok(()) => (),
            Err(e) => {
                error!(
                    "request id: {}, ReturnContainer fail with error {:?}",
                    &req.request_id, &e
                );
            }
        }

        // unknown requests are dropped by the pipeline; the ack is
        // unconditional
        return Ok(tonic::Response::new(sched::ReturnContainerReply {}));
    }
}

pub async fn RunSchedulerSvc() -> Result<()> {
    let svc = SchedSvc {
        router: ROUTER.get().unwrap().clone(),
    };

    let svcAddr = format!("0.0.0.0:{}", SCHED_CONFIG.svcPort);
    info!("scheduler service listen on {}", &svcAddr);

    Server::builder()
        .add_service(sched::scheduler_service_server::SchedulerServiceServer::new(svc))
        .serve(svcAddr.parse().unwrap())
        .await?;

    return Ok(());
}
