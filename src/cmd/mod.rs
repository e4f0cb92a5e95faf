use anyhow::{Context, Result};
use assistant_runtime::config::RuntimeConfig;
use assistant_runtime::core::model::ResolvedArtifact;
use assistant_runtime::format::{human_bytes, human_time};
use assistant_runtime::{
    ArtifactFormat, ArtifactValidator, Backend, GenerateRequest, GgufBackend, ModelRuntime, ModelSlot, StopReason,
    StreamEvent,
};
use futures::StreamExt;
use rustyline::error::ReadlineError;
use serde_json::json;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::GenerateOpts;

fn runtime(config: &RuntimeConfig) -> ModelRuntime {
    let gguf: Arc<dyn Backend> = Arc::new(GgufBackend::new());
    ModelRuntime::from_config(config, vec![(ModelSlot::Chat, gguf)])
}

fn request(config: &RuntimeConfig, prompt: &str, opts: &GenerateOpts) -> GenerateRequest {
    let mut params = config.sampling;
    if let Some(t) = opts.temperature {
        params.temperature = t;
    }
    if let Some(k) = opts.top_k {
        params.top_k = k;
    }
    if let Some(p) = opts.top_p {
        params.top_p = p;
    }

    let mut request = GenerateRequest::new(prompt).with_params(params);
    request.system_prompt = opts.system.clone();
    request.max_new_tokens = opts.max_tokens;
    request
}

pub async fn status(config: &RuntimeConfig, as_json: bool) -> Result<()> {
    let runtime = runtime(config);
    let (snapshot, decision) = runtime.registry().assess().context("resource assessment failed")?;
    let slots = runtime.registry().statuses();

    if as_json {
        let out = json!({
            "models_dir": config.models_dir,
            "snapshot": snapshot,
            "decision": decision,
            "slots": slots,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("models   {}", config.models_dir.display());
    println!("device   {}", snapshot.summary());
    println!(
        "budget   {} tier, {} ({} threads): {}",
        decision.tier,
        if decision.allowed { "allowed" } else { "refused" },
        decision.threads,
        decision.reason
    );
    println!();
    println!("{:<10} {:<10} {:<8} {:<10} {}", "SLOT", "STATE", "BACKEND", "TIER", "LOADED");
    for s in slots {
        println!(
            "{:<10} {:<10} {:<8} {:<10} {}",
            s.slot.as_str(),
            format!("{:?}", s.state).to_lowercase(),
            s.backend.as_deref().unwrap_or("-"),
            s.tier.map(|t| t.as_str()).unwrap_or("-"),
            human_time(s.last_loaded_at, "never")
        );
    }
    Ok(())
}

pub fn validate(config: &RuntimeConfig, path: &Path, format: Option<ArtifactFormat>, load_test: bool) -> Result<()> {
    let mut validator = ArtifactValidator::new().with_trial_loader(Arc::new(GgufBackend::new()), config.load_options());
    if !config.probe_format {
        validator = validator.without_format_probe();
    }

    let resolved = ResolvedArtifact {
        path: path.to_path_buf(),
        format,
        declared_size: None,
    };
    let artifact = validator.validate_resolved(&resolved, load_test)?;

    println!(
        "ok  {} ({}, {})",
        artifact.path().display(),
        artifact.format(),
        human_bytes(artifact.size())
    );
    Ok(())
}

/// Streams one reply to stdout. Ctrl-C stops decoding but keeps the
/// partial reply.
async fn stream_reply(runtime: &ModelRuntime, slot: ModelSlot, request: GenerateRequest) -> Result<()> {
    let mut stream = runtime.generate_streaming(slot, request).await?;
    let mut stdout = io::stdout();

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                continue;
            }
        };

        match event {
            Some(Ok(StreamEvent::Text(delta))) => {
                write!(stdout, "{}", delta)?;
                stdout.flush()?;
            }
            Some(Ok(StreamEvent::Done(stats))) => {
                writeln!(stdout)?;
                if stats.stop_reason == StopReason::Cancelled {
                    eprintln!("[cancelled]");
                }
                tracing::info!(
                    prompt = stats.prompt_tokens,
                    reused = stats.reused_tokens,
                    generated = stats.generated_tokens,
                    "{:.2?}",
                    stats.elapsed
                );
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

pub async fn generate(config: &RuntimeConfig, prompt: &str, opts: &GenerateOpts) -> Result<()> {
    let runtime = runtime(config);
    let result = stream_reply(&runtime, opts.slot, request(config, prompt, opts)).await;
    runtime.unload_all().await;
    result
}

pub async fn chat(config: &RuntimeConfig, opts: &GenerateOpts) -> Result<()> {
    let runtime = runtime(config);
    let mut editor = rustyline::DefaultEditor::new()?;

    println!(">>> Loading {} ...", opts.slot);
    runtime.ensure_loaded(opts.slot).await?;
    println!("Type /clear to reset the conversation, /status for slot info, /exit to quit");

    loop {
        let line = match editor.readline(">>> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match line {
            "/exit" | "/quit" | "/bye" => break,
            "/clear" => {
                runtime.clear_history(opts.slot).await?;
                println!("Cleared conversation.");
            }
            "/status" => {
                let status = runtime.status(opts.slot)?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            cmd if cmd.starts_with('/') => println!("Unknown command: {}", cmd),
            prompt => {
                if let Err(e) = stream_reply(&runtime, opts.slot, request(config, prompt, opts)).await {
                    eprintln!("Error: {:#}", e);
                }
            }
        }
    }

    runtime.unload_all().await;
    Ok(())
}
