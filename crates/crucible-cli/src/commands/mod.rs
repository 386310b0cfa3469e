//! CLI command implementations.

use anyhow::{Context, bail};
use futures::StreamExt;
use serde_json::json;

use crucible_config::formats::{PipelineFormat, YamlFormat};

/// Parse and validate a workflow file without contacting the server.
pub fn validate(path: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let pipeline = YamlFormat
        .parse(&text)
        .with_context(|| format!("parsing {path}"))?;
    pipeline.validate().context("validating pipeline")?;
    println!(
        "{path}: ok ({} stages, {} steps)",
        pipeline.stages.len(),
        pipeline.stages.iter().map(|s| s.steps.len()).sum::<usize>()
    );
    Ok(())
}

pub async fn trigger(api_url: &str, job: &str, org: &str, params: &[String]) -> anyhow::Result<()> {
    let mut parameters = serde_json::Map::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("parameter {param} is not key=value"))?;
        parameters.insert(key.to_string(), json!(value));
    }

    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/jobs/{job}/trigger"))
        .json(&json!({ "org_id": org, "parameters": parameters }))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("trigger failed: {} {}", response.status(), response.text().await?);
    }
    let body: serde_json::Value = response.json().await?;
    println!(
        "build {} (#{})",
        body["build_id"].as_str().unwrap_or("?"),
        body["build_number"]
    );
    Ok(())
}

pub async fn show(api_url: &str, id: &str) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api_url}/api/builds/{id}"))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("show failed: {}", response.status());
    }
    let body: serde_json::Value = response.json().await?;
    let build = &body["build"];
    println!(
        "build {} #{} {} (job {})",
        id, build["build_number"], build["status"].as_str().unwrap_or("?"), build["job_id"]
    );
    for stage in body["stages"].as_array().into_iter().flatten() {
        println!(
            "  stage {:30} {}",
            stage["name"].as_str().unwrap_or("?"),
            stage["status"].as_str().unwrap_or("?")
        );
    }
    for step in body["steps"].as_array().into_iter().flatten() {
        println!(
            "    step {:29} {} (exit {})",
            step["name"].as_str().unwrap_or("?"),
            step["status"].as_str().unwrap_or("?"),
            step["exit_code"]
        );
    }
    Ok(())
}

/// Tail the server-sent event stream for a build.
pub async fn watch(api_url: &str, id: &str, after: Option<&str>) -> anyhow::Result<()> {
    let mut url = format!("{api_url}/api/builds/{id}/events");
    if let Some(after) = after {
        url.push_str(&format!("?after={after}"));
    }
    let response = reqwest::Client::new().get(&url).send().await?;
    if !response.status().is_success() {
        bail!("watch failed: {}", response.status());
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end().to_string();
            buffer.drain(..=newline);
            if let Some(data) = line.strip_prefix("data: ") {
                if let Ok(event) = serde_json::from_str::<serde_json::Value>(data) {
                    print_event(&event);
                    if event["kind"] == "build-completed" {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &serde_json::Value) {
    let kind = event["kind"].as_str().unwrap_or("?");
    let stage = event["stage_name"].as_str().unwrap_or("");
    let step = event["step_name"].as_str().unwrap_or("");
    match kind {
        "step-log" => {
            let chunk = event["payload"]["chunk"].as_str().unwrap_or("");
            println!("{stage}/{step}: {chunk}");
        }
        _ => {
            let scope = match (stage.is_empty(), step.is_empty()) {
                (true, _) => String::new(),
                (false, true) => format!(" [{stage}]"),
                (false, false) => format!(" [{stage}/{step}]"),
            };
            println!("{kind}{scope} {}", event["payload"]);
        }
    }
}

pub async fn cancel(api_url: &str, id: &str) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/builds/{id}/cancel"))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("cancel failed: {}", response.status());
    }
    println!("cancellation requested for {id}");
    Ok(())
}

pub async fn retry(api_url: &str, id: &str) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/builds/{id}/retry"))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("retry failed: {} {}", response.status(), response.text().await?);
    }
    let body: serde_json::Value = response.json().await?;
    println!(
        "retry {} (attempt {})",
        body["build_id"].as_str().unwrap_or("?"),
        body["attempt_number"]
    );
    Ok(())
}
