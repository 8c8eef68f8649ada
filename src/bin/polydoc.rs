//! CLI binary for polydoc.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig` and a
//! `PipelineRequest`, runs one document, writes the requested artifacts.

use anyhow::{bail, Context, Result};
use clap::Parser;
use polydoc::{
    write_atomic, CancelToken, ExtractionSchema, LlmConfig, Pipeline, PipelineConfig,
    PipelineRequest, SummaryFormat,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Language verdict and document facts only (no API key needed)
  polydoc --inspect-only report.pdf

  # Translate a contract to French, preserving layout
  polydoc contract.pdf --translate French

  # Summarise in English as a PDF
  polydoc report.pdf --summarize English --summary-format pdf

  # Structured extraction against a schema file
  polydoc invoice.pdf --schema invoice-schema.json

  # Everything at once, artifacts into ./out
  polydoc contract.pdf --translate Japanese --summarize English \
      --schema fields.json --out-dir out

  # Steer the model without changing output formats
  polydoc report.pdf --summarize German \
      --instructions "write the summary in formal {target_language}"

SCHEMA FILES:
  A schema file is a JSON object:
    {"fields": {"vendor": {"kind": "string"},
                "total": {"kind": "float", "required": false},
                "line_items": {"kind": "list", "item": {"kind": "string"}}}}

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY       Completion service API key
  POLYDOC_MODEL        Override the model ID
  POLYDOC_ENDPOINT     Override the service base URL
  PDFIUM_LIB_PATH      Path to an existing libpdfium
"#;

/// Transform PDF documents: detect language, extract structured data,
/// translate with layout preserved, summarise.
#[derive(Parser, Debug)]
#[command(
    name = "polydoc",
    version,
    about = "Detect, extract, translate, and summarise PDF documents",
    arg_required_else_help = true,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Translate the document into this language (layout-preserving PDF).
    #[arg(long, value_name = "LANGUAGE")]
    translate: Option<String>,

    /// Summarise the document in this language.
    #[arg(long, value_name = "LANGUAGE")]
    summarize: Option<String>,

    /// Summary artifact format.
    #[arg(long, value_enum, default_value = "txt")]
    summary_format: SummaryFormatArg,

    /// Extraction schema file (JSON).
    #[arg(long, value_name = "FILE")]
    schema: Option<PathBuf>,

    /// Extra prompt instructions; may use the {target_language} placeholder.
    #[arg(long, default_value = "")]
    instructions: String,

    /// Directory for output artifacts. Default: alongside the input.
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Completion service API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model ID.
    #[arg(long, env = "POLYDOC_MODEL", default_value = "gemini-2.0-flash-lite")]
    model: String,

    /// Completion service base URL.
    #[arg(long, env = "POLYDOC_ENDPOINT")]
    endpoint: Option<String>,

    /// Number of concurrent completion calls.
    #[arg(short, long, default_value_t = 8)]
    concurrency: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, default_value_t = 0.3)]
    temperature: f32,

    /// Max model output tokens per call.
    #[arg(long, default_value_t = 8192)]
    max_tokens: usize,

    /// Retries per completion call on transient failure.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Per-call timeout in seconds.
    #[arg(long, default_value_t = 60)]
    api_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long)]
    password: Option<String>,

    /// Print document facts and the language verdict, then exit. No API key
    /// needed.
    #[arg(long)]
    inspect_only: bool,

    /// Print a JSON report to stdout instead of human-readable lines.
    #[arg(long)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SummaryFormatArg {
    Txt,
    Pdf,
}

impl From<SummaryFormatArg> for SummaryFormat {
    fn from(v: SummaryFormatArg) -> Self {
        match v {
            SummaryFormatArg::Txt => SummaryFormat::Txt,
            SummaryFormatArg::Pdf => SummaryFormat::Pdf,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    // Inspect mode never talks to the model, so a placeholder key is fine.
    let api_key = match (&cli.api_key, cli.inspect_only) {
        (Some(key), _) => key.clone(),
        (None, true) => String::new(),
        (None, false) => bail!("no API key: set GEMINI_API_KEY or pass --api-key"),
    };
    let mut llm = LlmConfig::new(api_key, &cli.model);
    if let Some(ref endpoint) = cli.endpoint {
        llm = llm.with_endpoint(endpoint);
    }
    let pipeline = Pipeline::new(llm, config).context("failed to initialise the pipeline")?;

    if cli.inspect_only {
        let (info, verdict) = pipeline
            .inspect(&cli.input)
            .await
            .context("failed to inspect PDF")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "document": info,
                    "verdict": verdict,
                }))?
            );
        } else {
            println!("File:        {}", info.filename);
            println!("Pages:       {}", info.page_count);
            println!("Blocks:      {}", info.block_count);
            println!("Characters:  {}", info.text_chars);
            println!(
                "Language:    {} ({})",
                verdict.code,
                verdict
                    .name
                    .as_deref()
                    .unwrap_or("undetermined")
            );
            println!("Confidence:  {:.2}", verdict.confidence);
        }
        return Ok(());
    }

    let request = build_request(&cli)?;
    if request.translation.is_none() && request.summary.is_none() && request.extraction.is_none() {
        bail!("nothing to do: pass --translate, --summarize, and/or --schema (or --inspect-only)");
    }

    // Ctrl-C stops new model calls; in-flight ones finish.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", yellow("cancelling: waiting for in-flight calls"));
                cancel.cancel();
            }
        });
    }

    let output = pipeline
        .process(&cli.input, &request, &cancel)
        .await
        .context("pipeline run failed")?;

    let out_dir = cli
        .out_dir
        .clone()
        .or_else(|| cli.input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    if !out_dir.exists() {
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
    }
    let stem = cli
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());

    let mut artifacts: Vec<PathBuf> = Vec::new();

    if let Some(ref extraction) = output.extraction {
        let path = out_dir.join(format!("{stem}.extract.json"));
        let body = serde_json::to_vec_pretty(&extraction.json)?;
        write_atomic(&path, &body).context("failed to write extraction JSON")?;
        artifacts.push(path);
    }

    if let Some(ref translation) = output.translation {
        let lang = cli.translate.as_deref().unwrap_or("translated");
        let path = out_dir.join(format!("{stem}.{}.pdf", slug(lang)));
        write_atomic(&path, &translation.pdf).context("failed to write translated PDF")?;
        artifacts.push(path);
    }

    if let Some(ref summary) = output.summary {
        let path = match summary.pdf {
            Some(ref pdf) => {
                let path = out_dir.join(format!("{stem}.summary.pdf"));
                write_atomic(&path, pdf).context("failed to write summary PDF")?;
                path
            }
            None => {
                let path = out_dir.join(format!("{stem}.summary.txt"));
                write_atomic(&path, summary.text.as_bytes())
                    .context("failed to write summary text")?;
                path
            }
        };
        artifacts.push(path);
    }

    if cli.json {
        let report = serde_json::json!({
            "document": output.document,
            "verdict": output.verdict,
            "stats": output.stats,
            "artifacts": artifacts,
            "failed_blocks": output
                .translation
                .as_ref()
                .map(|t| t.failed_blocks.clone()),
            "failed_chunks": output
                .summary
                .as_ref()
                .map(|s| s.failed_chunks.clone()),
            "repaired_extraction": output.extraction.as_ref().map(|e| e.repaired),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !cli.quiet {
        let degraded = output
            .translation
            .as_ref()
            .map_or(0, |t| t.failed_blocks.len())
            + output.summary.as_ref().map_or(0, |s| s.failed_chunks.len());
        let mark = if degraded == 0 {
            green("✔")
        } else {
            yellow("⚠")
        };
        eprintln!(
            "{mark}  {} — {} ({:.2}) — {}ms, {} model calls",
            bold(&output.document.filename),
            output.verdict.code,
            output.verdict.confidence,
            output.stats.total_duration_ms,
            output.stats.gateway_calls,
        );
        for path in &artifacts {
            eprintln!("   → {}", bold(&path.display().to_string()));
        }
        if degraded > 0 {
            eprintln!(
                "   {}",
                dim(&format!("{degraded} block(s)/chunk(s) degraded; see markers in output"))
            );
        }
        io::stderr().flush().ok();
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .concurrency(cli.concurrency)
        .temperature(cli.temperature)
        .max_output_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    builder.build().context("invalid configuration")
}

fn build_request(cli: &Cli) -> Result<PipelineRequest> {
    let mut request = PipelineRequest::new().instructions(&cli.instructions);
    if let Some(ref schema_path) = cli.schema {
        let body = std::fs::read_to_string(schema_path)
            .with_context(|| format!("failed to read schema file {}", schema_path.display()))?;
        let schema: ExtractionSchema = serde_json::from_str(&body)
            .with_context(|| format!("invalid schema in {}", schema_path.display()))?;
        if schema.fields.is_empty() {
            bail!("schema in {} declares no fields", schema_path.display());
        }
        request = request.extract(schema);
    }
    if let Some(ref lang) = cli.translate {
        request = request.translate(lang);
    }
    if let Some(ref lang) = cli.summarize {
        request = request.summarize(lang, cli.summary_format.into());
    }
    Ok(request)
}

/// Filename-safe slug for a language tag.
fn slug(language: &str) -> String {
    language
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
