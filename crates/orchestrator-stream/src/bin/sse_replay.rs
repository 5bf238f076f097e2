// sse-replay: run a captured SSE transcript (or a live endpoint) through the
// orchestrator and print the events and the final result.
//
// Usage:
//   sse-replay capture.sse
//   sse-replay capture.sse --chunk-size 7 --events
//   sse-replay --url http://localhost:3000/api/chat/llm/stream --data '{"message":"hi"}'

use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;

use orchestrator_stream::{
    Orchestrator, OrchestratorConfig, StreamError, StreamObserver, StreamResult, ToolCall,
    init_observability,
};

#[derive(Parser)]
#[command(
    name = "sse-replay",
    about = "Replay an SSE generation stream through the streaming orchestrator."
)]
struct Cli {
    /// Captured SSE transcript to replay.
    #[arg(value_name = "FILE", required_unless_present = "url", conflicts_with = "url")]
    file: Option<PathBuf>,

    /// Stream from an HTTP endpoint instead of a file.
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// JSON request body; sends a POST when set, a GET otherwise.
    #[arg(long, value_name = "JSON", requires = "url")]
    data: Option<String>,

    /// Re-chunk the transcript into pieces of this many bytes.
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(usize))]
    chunk_size: Option<usize>,

    /// Print every event as it is emitted.
    #[arg(long)]
    events: bool,

    /// Disable recovery of tool calls embedded in text.
    #[arg(long)]
    no_xml_recovery: bool,
}

struct Printer {
    enabled: bool,
}

impl StreamObserver for Printer {
    fn on_stream_chunk(&mut self, text: &str) {
        if self.enabled {
            println!("chunk       {text:?}");
        }
    }

    fn on_tool_calls(&mut self, calls: &[ToolCall], source: &str) {
        if self.enabled {
            for call in calls {
                println!(
                    "tool_call   [{source}] {} {}({})",
                    call.id, call.function.name, call.function.arguments
                );
            }
        }
    }

    fn on_tool_execution(&mut self, count: usize, calls: &[ToolCall]) {
        if self.enabled {
            let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
            println!("execution   count={count} ids={ids:?}");
        }
    }

    fn on_tool_result(
        &mut self,
        name: &str,
        result: &serde_json::Value,
        success: bool,
        call_id: Option<&str>,
    ) {
        if self.enabled {
            println!(
                "tool_result {name} id={} success={success} {result}",
                call_id.unwrap_or("-")
            );
        }
    }

    fn on_model_info(&mut self, model: &orchestrator_stream::ModelSelection) {
        if self.enabled {
            println!(
                "model       {} (requested {})",
                model.current.as_deref().unwrap_or("?"),
                model.original.as_deref().unwrap_or("?")
            );
        }
    }

    fn on_error(&mut self, error: &StreamError) {
        if self.enabled {
            println!("error       {error}");
        }
    }
}

fn rechunk(data: Bytes, chunk_size: Option<usize>) -> Vec<Result<Bytes, std::io::Error>> {
    match chunk_size.filter(|n| *n > 0) {
        None => vec![Ok(data)],
        Some(size) => (0..data.len())
            .step_by(size)
            .map(|start| Ok(data.slice(start..(start + size).min(data.len()))))
            .collect(),
    }
}

async fn replay(cli: &Cli, orchestrator: &mut Orchestrator) -> Result<StreamResult, String> {
    let mut printer = Printer {
        enabled: cli.events,
    };

    if let Some(url) = &cli.url {
        let client = reqwest::Client::new();
        let request = match &cli.data {
            Some(body) => {
                let json: serde_json::Value =
                    serde_json::from_str(body).map_err(|e| format!("invalid --data JSON: {e}"))?;
                client.post(url).json(&json)
            }
            None => client.get(url),
        };
        return orchestrator
            .process_request(request, &mut printer)
            .await
            .map_err(|e| format!("{url}: {e}"));
    }

    let Some(path) = &cli.file else {
        return Err("specify a transcript file or --url".to_string());
    };
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = data.len(), "replaying transcript");
    let reader = futures::stream::iter(rechunk(Bytes::from(data), cli.chunk_size));
    Ok(orchestrator.process_stream(reader, &mut printer).await)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_observability();

    let config = match OrchestratorConfig::from_env() {
        Ok(config) if cli.no_xml_recovery => config.xml_recovery(false),
        Ok(config) => config,
        Err(e) => {
            tracing::error!(%e, "invalid orchestrator configuration");
            std::process::exit(2);
        }
    };
    let mut orchestrator = match Orchestrator::with_config(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(%e, "invalid orchestrator configuration");
            std::process::exit(2);
        }
    };

    let result = match replay(&cli, &mut orchestrator).await {
        Ok(result) => result,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(2);
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(%e, "cannot serialize result");
            std::process::exit(2);
        }
    }
    if !result.success {
        std::process::exit(1);
    }
}
