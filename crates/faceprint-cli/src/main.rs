use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceprint_core::Embedding;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceprint", about = "Faceprint embedding service CLI")]
struct Cli {
    /// Base URL of the faceprintd server
    #[arg(long, default_value = "http://localhost:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health
    Health,
    /// Compute an embedding for an image
    Embed {
        /// Image file to upload
        file: Option<PathBuf>,
        /// Path on the server filesystem instead of an upload
        #[arg(long, conflicts_with = "file")]
        path: Option<String>,
        /// Remote image URL instead of an upload
        #[arg(long, conflicts_with_all = ["file", "path"])]
        url: Option<String>,
    },
    /// Search for similar faces
    Search {
        /// Image file to upload
        file: PathBuf,
        /// Number of results to return
        #[arg(long, default_value_t = 5)]
        top: u32,
        /// Include the raw embedding in the output
        #[arg(long)]
        show_embedding: bool,
    },
    /// Compare two images by embedding cosine similarity
    Compare {
        a: PathBuf,
        b: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Health => {
            let body: Value = client
                .get(format!("{}/health", cli.server))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Embed { file, path, url } => {
            let body = match (file, path, url) {
                (Some(file), None, None) => {
                    post_upload(&client, &cli.server, "/embed", &file, &[]).await?
                }
                (None, Some(path), None) => {
                    post_json(&client, &cli.server, "/embed", json!({ "image_path": path }))
                        .await?
                }
                (None, None, Some(url)) => {
                    post_json(&client, &cli.server, "/embed", json!({ "url": url })).await?
                }
                _ => bail!("provide an image file, --path or --url"),
            };
            println!("{}", serde_json::to_string_pretty(&summarize(body))?);
        }
        Commands::Search { file, top, show_embedding } => {
            let body = post_upload(
                &client,
                &cli.server,
                "/search",
                &file,
                &[
                    ("top", top.to_string()),
                    ("embedding", show_embedding.to_string()),
                ],
            )
            .await?;
            let body = if show_embedding { body } else { summarize(body) };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Compare { a, b } => {
            let body_a = post_upload(&client, &cli.server, "/embed", &a, &[]).await?;
            let body_b = post_upload(&client, &cli.server, "/embed", &b, &[]).await?;
            let embedding_a = embedding_from(&body_a)
                .with_context(|| format!("no embedding for {}", a.display()))?;
            let embedding_b = embedding_from(&body_b)
                .with_context(|| format!("no embedding for {}", b.display()))?;
            println!("similarity: {:.4}", embedding_a.similarity(&embedding_b));
        }
    }

    Ok(())
}

async fn post_upload(
    client: &reqwest::Client,
    server: &str,
    route: &str,
    file: &Path,
    extra_fields: &[(&str, String)],
) -> Result<Value> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
        .to_string();

    let mut form = reqwest::multipart::Form::new()
        .part("image", reqwest::multipart::Part::bytes(bytes).file_name(filename));
    for (name, value) in extra_fields {
        form = form.text(name.to_string(), value.clone());
    }

    let body = client
        .post(format!("{server}{route}"))
        .multipart(form)
        .send()
        .await?
        .json()
        .await?;
    Ok(body)
}

async fn post_json(
    client: &reqwest::Client,
    server: &str,
    route: &str,
    body: Value,
) -> Result<Value> {
    let body = client
        .post(format!("{server}{route}"))
        .json(&body)
        .send()
        .await?
        .json()
        .await?;
    Ok(body)
}

/// Replace the embedding array with a short placeholder for readable output.
fn summarize(mut body: Value) -> Value {
    if let Some(embedding) = body.get_mut("embedding") {
        let n = embedding.as_array().map(|a| a.len()).unwrap_or(0);
        *embedding = Value::String(format!("[{n} values]"));
    }
    body
}

fn embedding_from(body: &Value) -> Option<Embedding> {
    let values = body
        .get("embedding")?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();
    Some(Embedding { values })
}
