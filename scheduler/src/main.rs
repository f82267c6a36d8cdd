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

#![allow(dead_code)]
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

#[macro_use]
extern crate log;
extern crate simple_logging;

#[macro_use]
extern crate scopeguard;

pub mod container;
pub mod func;
pub mod message;
pub mod node;
pub mod return_handler;
pub mod router;
pub mod sched_svc;

use lazy_static::lazy_static;
use once_cell::sync::OnceCell;

use fshare::common::*;
use fshare::config::SchedulerConfig;

use router::Router;
use sched_svc::RunSchedulerSvc;

lazy_static! {
    pub static ref SCHED_CONFIG: SchedulerConfig = {
        let args: Vec<String> = std::env::args().collect();
        if args.len() < 2 {
            SchedulerConfig::default()
        } else {
            let configFilePath = &args[1];
            SchedulerConfig::Load(configFilePath)
                .expect(&format!("can't load config from {}", configFilePath))
        }
    };
}

pub static ROUTER: OnceCell<Router> = OnceCell::new();

#[tokio::main]
async fn main() -> Result<()> {
    defer!(error!("scheduler finish"));
    if log4rs::init_file("scheduler_logging_config.yaml", Default::default()).is_err() {
        simple_logging::log_to_stderr(log::LevelFilter::Info);
    }

    error!("scheduler config is {:#?}", &SCHED_CONFIG.clone());

    ROUTER.set(Router::New(&SCHED_CONFIG)).unwrap();
    let router = ROUTER.get().unwrap().clone();

    let processFuture = router.Process();
    let svcFuture = RunSchedulerSvc();

    tokio::select! {
        res = processFuture => {
            error!("return pipeline finish with res {:?}", res);
        }
        res = svcFuture => {
            error!("scheduler service finish with res {:?}", res);
        }
    }

    return Ok(());
}
