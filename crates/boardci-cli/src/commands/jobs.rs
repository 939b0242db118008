//! Job commands against a running server.

use anyhow::{Context, Result, bail};
use serde_json::Value;

fn job_url(api_url: &str, unique_id: u64, sha: &str, action: &str) -> String {
    format!(
        "{}/api/v1/jobs/{}/{}/{}",
        api_url.trim_end_matches('/'),
        unique_id,
        sha,
        action
    )
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("Server answered {}: {}", status, text);
    }
    Ok(response)
}

pub async fn list(api_url: &str, limit: usize) -> Result<()> {
    let url = format!("{}/api/v1/jobs?limit={}", api_url.trim_end_matches('/'), limit);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let list: Value = check(response).await?.json().await?;

    match list["queue"]["running"].as_object() {
        Some(job) => println!("Running: {}", describe(job)),
        None => println!("Running: -"),
    }
    let pending = list["queue"]["pending"].as_array().cloned().unwrap_or_default();
    println!("Pending: {}", pending.len());
    for job in pending.iter().filter_map(|j| j.as_object()) {
        println!("  {}", describe(job));
    }

    println!("\nRecent:");
    for record in list["recent"].as_array().cloned().unwrap_or_default() {
        let identity = &record["identity"];
        println!(
            "  {:<10} {}#{} {}/{}",
            record["status"].as_str().unwrap_or("?"),
            identity["project_full_name"].as_str().unwrap_or("?"),
            identity["change_number"],
            identity["unique_id"],
            identity["commit_ref"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn describe(job: &serde_json::Map<String, Value>) -> String {
    let identity = &job["identity"];
    let user = if job["user_initiated"].as_bool() == Some(true) {
        " (restarted)"
    } else {
        ""
    };
    format!(
        "{}#{} {}/{}{}",
        identity["project_full_name"].as_str().unwrap_or("?"),
        identity["change_number"],
        identity["unique_id"],
        identity["commit_ref"].as_str().unwrap_or("?"),
        user
    )
}

pub async fn cancel(api_url: &str, unique_id: u64, sha: &str) -> Result<()> {
    post(&job_url(api_url, unique_id, sha, "cancel")).await
}

pub async fn restart(api_url: &str, unique_id: u64, sha: &str) -> Result<()> {
    post(&job_url(api_url, unique_id, sha, "restart")).await
}

async fn post(url: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let body: Value = check(response).await?.json().await?;
    println!("{}", body["status"].as_str().unwrap_or("ok"));
    Ok(())
}

pub async fn logs(api_url: &str, unique_id: u64, sha: &str) -> Result<()> {
    let url = job_url(api_url, unique_id, sha, "logs");
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    print!("{}", check(response).await?.text().await?);
    Ok(())
}
