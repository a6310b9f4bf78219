use async_trait::async_trait;
use rabbitmq_rpc_worker::{shutdown_on_ctrl_c, MessageHandler, ServiceRuntime, WorkerConfig, WorkerError};
use serde::{Deserialize, Serialize};
use std::process::ExitCode;

// 1. Define the request and reply documents
#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Operation {
    Add { a: i64, b: i64 },
    Mul { a: i64, b: i64 },
}

#[derive(Serialize, Debug)]
struct Answer {
    result: i64,
}

// 2. Implement the `MessageHandler` trait for your logic
struct Arithmetic;

#[async_trait]
impl MessageHandler for Arithmetic {
    type Request = Operation;
    type Response = Answer;

    fn handler_name(&self) -> &str {
        "arithmetic"
    }

    async fn handle_message(&self, request: Operation) -> Result<Answer, WorkerError> {
        log::info!("Received {:?}", request);

        let result = match request {
            Operation::Add { a, b } => a.checked_add(b),
            Operation::Mul { a, b } => a.checked_mul(b),
        };
        result
            .map(|result| Answer { result })
            .ok_or_else(|| WorkerError::from("arithmetic overflow"))
    }
}

// 3. Configure from the environment and run until ctrl+c
#[tokio::main]
async fn main() -> ExitCode {
    // A local .env file is optional; real environment variables win.
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "service", "{}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match ServiceRuntime::with_message_handler(config, Arithmetic) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!(target: "service", "{}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.run(shutdown_on_ctrl_c()).await {
        Ok(()) => {
            log::info!("Worker has shut down.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Worker stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
