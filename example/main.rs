use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use httpflow::*;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// 模拟 httpbin 服务
struct FakeHttpbin {
    sensor_pokes: AtomicU32,
}

#[async_trait]
impl HttpClient for FakeHttpbin {
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse, FlowError> {
        tokio::time::sleep(Duration::from_millis(50)).await;

        if request.endpoint.is_empty() {
            // 前两次探测时服务尚未就绪
            let poke = self.sensor_pokes.fetch_add(1, Ordering::SeqCst);
            let page = if poke < 2 { "starting" } else { "<title>httpbin.org</title>" };
            return Ok(HttpResponse::ok(page));
        }

        let cursor = match request.body.as_ref().and_then(|b| b.get("cursor")) {
            Some(Value::String(c)) if c.is_empty() => json!("c1"),
            Some(Value::String(c)) if c == "c1" => json!("c2"),
            _ => Value::Null,
        };
        let body = json!({
            "method": request.method,
            "url": format!("https://httpbin.org/{}", request.endpoint),
            "headers": request.headers,
            "json": request.body.clone().filter(Value::is_object),
            "data": request.body.clone().filter(Value::is_string),
            "nested": { "property": "value" },
            "cursor": cursor,
        });
        Ok(HttpResponse::ok(body.to_string()))
    }
}

fn build_graph() -> Result<TaskGraph, FlowError> {
    let retry = RetryPolicy::new(1, Duration::from_secs(1));
    let mut graph = TaskGraph::new();

    graph.add_task(
        Task::sensor(
            "http_sensor_check",
            HttpRequest::new(Method::Get, ""),
            PollingSensor::new(Duration::from_millis(500), Duration::from_secs(30)),
        )
        .with_response_check(|r: &HttpResponse| -> Result<bool, FlowError> {
            Ok(r.text().contains("httpbin"))
        }),
        Vec::<String>::new(),
    )?;

    graph.add_task(
        Task::single_call(
            "post_op",
            HttpRequest::new(Method::Post, "post")
                .with_header("Content-Type", "application/json")
                .with_body(json!({ "priority": 5 })),
        )
        .with_retry_policy(retry.clone())
        .with_response_check(|r: &HttpResponse| -> Result<bool, FlowError> {
            Ok(r.json()?["json"]["priority"] == 5)
        }),
        ["http_sensor_check"],
    )?;

    graph.add_task(
        Task::single_call(
            "get_op",
            HttpRequest::new(Method::Get, "get")
                .with_body(json!({ "param1": "value1", "param2": "value2" })),
        )
        .with_retry_policy(retry.clone()),
        ["post_op"],
    )?;

    graph.add_task(
        Task::single_call("get_op_response_filter", HttpRequest::new(Method::Get, "get"))
            .with_retry_policy(retry.clone())
            .with_response_filter(|r: &HttpResponse| -> Result<Value, FlowError> {
                Ok(r.json()?["nested"]["property"].clone())
            }),
        ["get_op"],
    )?;

    graph.add_task(
        Task::single_call(
            "put_op",
            HttpRequest::new(Method::Put, "put")
                .with_header("Content-Type", "application/json")
                .with_body(json!({ "priority": 5 })),
        )
        .with_retry_policy(retry.clone()),
        ["get_op_response_filter"],
    )?;

    graph.add_task(
        Task::single_call(
            "del_op",
            HttpRequest::new(Method::Delete, "delete")
                .with_header("Content-Type", "application/x-www-form-urlencoded")
                .with_body("some=data"),
        )
        .with_retry_policy(retry.clone()),
        ["put_op"],
    )?;

    graph.add_task(
        Task::single_call(
            "post_op_formenc",
            HttpRequest::new(Method::Post, "post")
                .with_header("Content-Type", "application/x-www-form-urlencoded")
                .with_body("name=Joe"),
        )
        .with_retry_policy(retry.clone()),
        ["del_op"],
    )?;

    graph.add_task(
        Task::paginated(
            "get_paginated",
            HttpRequest::new(Method::Get, "get").with_body(json!({ "cursor": "" })),
            PaginatedCaller::new(20),
        )
        .with_retry_policy(retry),
        ["post_op_formenc"],
    )?;

    graph.freeze()?;
    Ok(graph)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let graph = build_graph()?;
    let executor = Executor::new(Arc::new(FakeHttpbin {
        sensor_pokes: AtomicU32::new(0),
    }));
    let ctx = CancellationToken::new();

    println!("=== 任务依赖图 ===");
    print!("{}", graph.render());

    println!("=== 开始执行任务 ===");
    let start = std::time::Instant::now();
    let state = executor.run(&graph, ctx).await?;
    let duration = start.elapsed();

    println!("=== 执行完成 ===");
    println!("执行时间: {:?}", duration);
    println!("执行结果: {}", serde_json::to_string_pretty(&state)?);
    println!("执行顺序: {}", state.summary());

    Ok(())
}
