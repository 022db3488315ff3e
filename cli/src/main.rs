//! Companion admin CLI for the Lectern knowledge-base service.
//!
//! Thin client over the KB HTTP API. Every command prints the server's JSON
//! response; any HTTP error (or non-2xx status) exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

/// Lectern knowledge-base admin tool.
#[derive(Debug, Parser)]
#[command(name = "lectern-cli", version, about)]
struct Cli {
    /// Server base URL.
    #[arg(long, env = "LECTERN_URL", default_value = "http://localhost:9099")]
    url: String,
    /// API key (bearer).
    #[arg(long, env = "API_KEY")]
    api_key: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Knowledge-base operations.
    #[command(subcommand)]
    Kb(KbCommand),
}

#[derive(Debug, Subcommand)]
enum KbCommand {
    /// List collections.
    List {
        /// Filter by owner.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show one collection.
    Get {
        /// Collection id.
        id: i64,
    },
    /// Create a collection.
    Create(CreateArgs),
    /// Update a collection's description or visibility.
    Update {
        /// Collection id.
        id: i64,
        /// New description.
        #[arg(long)]
        description: Option<String>,
        /// New visibility (private/public).
        #[arg(long)]
        visibility: Option<String>,
    },
    /// Delete a collection.
    Delete {
        /// Collection id.
        id: i64,
    },
    /// Make a collection public (shared with every tenant user).
    Share {
        /// Collection id.
        id: i64,
    },
    /// Upload and ingest a file.
    Upload {
        /// Collection id.
        id: i64,
        /// File to upload.
        file: PathBuf,
        /// Ingestion plugin.
        #[arg(long, default_value = "markitdown_plus_ingest")]
        plugin: String,
        /// Plugin parameters as a JSON string.
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Ingest URLs (or video links) without an upload.
    Ingest {
        /// Collection id.
        id: i64,
        /// URLs to ingest.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Ingestion plugin.
        #[arg(long, default_value = "url_ingest")]
        plugin: String,
        /// Plugin parameters as a JSON string.
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Query a collection.
    Query {
        /// Collection id.
        id: i64,
        /// The query text.
        query_text: String,
        /// Results to return.
        #[arg(long)]
        top_k: Option<u32>,
        /// Similarity floor.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Delete a file from a collection.
    DeleteFile {
        /// Collection id.
        id: i64,
        /// File registry id.
        file_id: i64,
        /// Hard-delete (remove the row and stored file).
        #[arg(long)]
        hard: bool,
    },
    /// List ingestion plugins.
    Plugins,
    /// List query plugins.
    QueryPlugins,
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Collection name.
    name: String,
    /// Owner identifier.
    #[arg(long)]
    owner: String,
    /// Description.
    #[arg(long)]
    description: Option<String>,
    /// Visibility (private/public).
    #[arg(long, default_value = "private")]
    visibility: String,
    /// Shared embeddings setup id.
    #[arg(long)]
    setup: Option<i64>,
    /// Inline embeddings vendor (legacy mode).
    #[arg(long)]
    vendor: Option<String>,
    /// Inline embeddings model (legacy mode).
    #[arg(long)]
    model: Option<String>,
    /// Inline embeddings API key (legacy mode).
    #[arg(long)]
    api_key: Option<String>,
    /// Embedding dimensions (required with an inline config).
    #[arg(long)]
    dimensions: Option<i64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::new(cli.url, cli.api_key)?;
    let Command::Kb(command) = cli.command;

    let response = match command {
        KbCommand::List { owner } => {
            let query = owner
                .map(|o| format!("?owner={o}"))
                .unwrap_or_default();
            client.get(&format!("/collections{query}")).await?
        }
        KbCommand::Get { id } => client.get(&format!("/collections/{id}")).await?,
        KbCommand::Create(args) => {
            let mut body = json!({
                "name": args.name,
                "owner": args.owner,
                "visibility": args.visibility,
            });
            if let Some(description) = args.description {
                body["description"] = json!(description);
            }
            if let Some(setup) = args.setup {
                body["embeddings_setup_id"] = json!(setup);
            } else {
                let vendor = args
                    .vendor
                    .context("either --setup or --vendor/--model is required")?;
                let model = args.model.context("--model is required with --vendor")?;
                body["embeddings_model"] = json!({
                    "vendor": vendor,
                    "model": model,
                    "api_key": args.api_key,
                });
                body["embedding_dimensions"] = json!(args
                    .dimensions
                    .context("--dimensions is required with an inline config")?);
            }
            client.post("/collections", &body).await?
        }
        KbCommand::Update {
            id,
            description,
            visibility,
        } => {
            if description.is_none() && visibility.is_none() {
                anyhow::bail!("no fields to update; provide --description or --visibility");
            }
            let body = json!({"description": description, "visibility": visibility});
            client.put(&format!("/collections/{id}"), &body).await?
        }
        KbCommand::Delete { id } => client.delete(&format!("/collections/{id}")).await?,
        KbCommand::Share { id } => {
            let body = json!({"visibility": "public"});
            client.put(&format!("/collections/{id}"), &body).await?
        }
        KbCommand::Upload {
            id,
            file,
            plugin,
            params,
        } => {
            let params: Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            client
                .upload(&format!("/collections/{id}/ingest-file"), &file, &plugin, &params)
                .await?
        }
        KbCommand::Ingest {
            id,
            urls,
            plugin,
            params,
        } => {
            let params: Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let body = json!({
                "urls": urls,
                "plugin_name": plugin,
                "plugin_params": params,
            });
            client
                .post(&format!("/collections/{id}/ingest-url"), &body)
                .await?
        }
        KbCommand::Query {
            id,
            query_text,
            top_k,
            threshold,
        } => {
            let body = json!({
                "query_text": query_text,
                "top_k": top_k,
                "threshold": threshold,
            });
            client.post(&format!("/collections/{id}/query"), &body).await?
        }
        KbCommand::DeleteFile { id, file_id, hard } => {
            client
                .delete(&format!("/collections/{id}/files/{file_id}?hard={hard}"))
                .await?
        }
        KbCommand::Plugins => client.get("/ingestion-plugins").await?,
        KbCommand::QueryPlugins => client.get("/query-plugins").await?,
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Minimal API client; non-2xx responses become errors (non-zero exit).
struct Client {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl Client {
    fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()?,
        })
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let request = self.http.get(format!("{}{path}", self.base_url));
        self.send(request).await
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let request = self.http.post(format!("{}{path}", self.base_url)).json(body);
        self.send(request).await
    }

    async fn put(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let request = self.http.put(format!("{}{path}", self.base_url)).json(body);
        self.send(request).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let request = self.http.delete(format!("{}{path}", self.base_url));
        self.send(request).await
    }

    async fn upload(
        &self,
        path: &str,
        file: &PathBuf,
        plugin: &str,
        params: &Value,
    ) -> anyhow::Result<Value> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_owned());

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            )
            .text("plugin_name", plugin.to_owned())
            .text("plugin_params", params.to_string());

        let request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .multipart(form);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("server returned {status}: {body}");
        }
        Ok(body)
    }
}
