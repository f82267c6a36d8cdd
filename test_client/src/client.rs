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

#![allow(non_snake_case)]

use std::env;

use uuid::Uuid;

use fshare::sched::scheduler_service_client::SchedulerServiceClient;
use fshare::sched::{AcquireContainerRequest, FunctionConfig, ReturnContainerRequest};

const SCHED_ADDR: &str = "http://127.0.0.1:10600";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Vec::new();
    for arg in env::args() {
        args.push(arg);
    }

    let cmd = if args.len() < 2 { "trip" } else { &args[1] };

    match cmd {
        "acquire" => {
            let requestId = Uuid::new_v4().to_string();
            return Acquire(&requestId).await;
        }
        "return" => {
            if args.len() < 4 {
                panic!("usage: test_client return <request_id> <container_id>");
            }
            return Return(&args[2], &args[3]).await;
        }
        "trip" => {
            return Trip().await;
        }
        _ => {
            panic!("doesn't support the command {:?}", cmd);
        }
    }
}

async fn Acquire(requestId: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = SchedulerServiceClient::connect(SCHED_ADDR).await?;

    let request = tonic::Request::new(AcquireContainerRequest {
        request_id: requestId.to_owned(),
        account_id: "test-account".to_owned(),
        function_name: "echo".to_owned(),
        function_config: Some(FunctionConfig {
            handler: "index.handler".to_owned(),
            timeout_in_ms: 3000,
            memory_in_bytes: 128 * 1024 * 1024,
        }),
    });
    let response = client.acquire_container(request).await?;
    let reply = response.into_inner();

    println!("request_id={}", requestId);
    println!("node_id={}", reply.node_id);
    println!("node_address={}:{}", reply.node_address, reply.node_service_port);
    println!("container_id={}", reply.container_id);

    Ok(())
}

async fn Return(requestId: &str, containerId: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = SchedulerServiceClient::connect(SCHED_ADDR).await?;

    let request = tonic::Request::new(ReturnContainerRequest {
        request_id: requestId.to_owned(),
        container_id: containerId.to_owned(),
        max_memory_usage_in_bytes: 64 * 1024 * 1024,
        duration_in_nanos: 5 * 1_000_000,
    });
    let response = client.return_container(request).await?;

    println!("RESPONSE={:?}", response);

    Ok(())
}

async fn Trip() -> Result<(), Box<dyn std::error::Error>> {
    let mut client = SchedulerServiceClient::connect(SCHED_ADDR).await?;

    let requestId = Uuid::new_v4().to_string();
    let request = tonic::Request::new(AcquireContainerRequest {
        request_id: requestId.clone(),
        account_id: "test-account".to_owned(),
        function_name: "echo".to_owned(),
        function_config: Some(FunctionConfig {
            handler: "index.handler".to_owned(),
            timeout_in_ms: 3000,
            memory_in_bytes: 128 * 1024 * 1024,
        }),
    });
    let response = client.acquire_container(request).await?;
    let reply = response.into_inner();
    println!(
        "acquired container {} on node {} ({}:{})",
        reply.container_id, reply.node_id, reply.node_address, reply.node_service_port
    );

    let request = tonic::Request::new(ReturnContainerRequest {
        request_id: requestId,
        container_id: reply.container_id,
        max_memory_usage_in_bytes: 64 * 1024 * 1024,
        duration_in_nanos: 5 * 1_000_000,
    });
    client.return_container(request).await?;
    println!("returned");

    Ok(())
}
