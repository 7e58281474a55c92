use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mosaic_contracts::config::Config;
use mosaic_contracts::events::EventWriter;
use mosaic_contracts::graph::{
    describe_editable_nodes, infer_roles, summarize, GenerationRequest, Graph,
};
use mosaic_contracts::templates::TemplateStore;
use mosaic_engine::{
    ConcurrencyGate, DryrunEngine, GeneratedImage, GraphGenerator, HostedGenerator,
    HostedRequest, HttpEngineClient,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "mosaic", version, about = "Graph-template image generation client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Hosted(HostedArgs),
    #[command(subcommand)]
    Templates(TemplatesCommand),
    Check,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, conflicts_with = "template_file")]
    template: Option<String>,
    #[arg(long)]
    template_file: Option<PathBuf>,
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    seed: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct HostedArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum TemplatesCommand {
    List,
    Show {
        name: String,
    },
    Import {
        name: String,
        path: PathBuf,
    },
    Delete {
        name: String,
    },
    /// Overwrite one scalar input; VALUE is parsed as JSON, else taken as text.
    Set {
        name: String,
        node: String,
        input: String,
        value: String,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mosaic error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = Config::load();
    match cli.command {
        Command::Generate(args) => run_generate(&config, args),
        Command::Hosted(args) => run_hosted(&config, args),
        Command::Templates(command) => run_templates(&config, command),
        Command::Check => run_check(&config),
    }
}

fn run_generate(config: &Config, args: GenerateArgs) -> Result<i32> {
    let store = TemplateStore::new(&config.templates_dir);
    let template = resolve_template(config, &store, &args)?;
    let request = GenerationRequest {
        prompt_text: args.prompt.clone(),
        negative_prompt_text: args.negative.clone(),
        seed: args.seed,
        width: args.width,
        height: args.height,
        aspect_ratio: args.aspect_ratio.clone(),
        reference_image_urls: args.references.clone(),
    };

    let generator = if args.dryrun {
        GraphGenerator::new(
            Arc::new(DryrunEngine::new()),
            Arc::new(ConcurrencyGate::new("dryrun", config.max_concurrent_jobs)),
        )
    } else {
        GraphGenerator::from_config(config)
    };
    let generator =
        generator.with_events(args.events.as_ref().map(|path| EventWriter::new(path, "mosaic-cli")));

    let mut on_progress = |elapsed_ms: u64| {
        eprintln!("still generating ({}s elapsed)", elapsed_ms / 1000);
    };
    let image = generator.generate(&template, &request, Some(&mut on_progress))?;
    let path = write_image(&args.out, &image)?;

    if let Some(warning) = &image.warning {
        eprintln!("warning: {warning}");
    }
    println!("Saved {} (job {}, seed {})", path.display(), image.job_id, display_seed(&image));
    Ok(0)
}

fn resolve_template(config: &Config, store: &TemplateStore, args: &GenerateArgs) -> Result<Graph> {
    if let Some(path) = &args.template_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        return Graph::from_json_str(&raw);
    }
    let name = args
        .template
        .clone()
        .or_else(|| config.default_template.clone());
    match name {
        Some(name) => store.load(&name),
        None => bail!(
            "no template selected: pass --template or --template-file, or set MOSAIC_DEFAULT_TEMPLATE (available: {})",
            available_templates(store)
        ),
    }
}

fn write_image(out: &Path, image: &GeneratedImage) -> Result<PathBuf> {
    let path = if out.is_dir() {
        out.join(format!("{}.{}", image.job_id, image.extension()))
    } else {
        out.to_path_buf()
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&path, &image.bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}

fn display_seed(image: &GeneratedImage) -> String {
    image
        .seed
        .map(|seed| seed.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn run_hosted(config: &Config, args: HostedArgs) -> Result<i32> {
    let generator = HostedGenerator::from_config(config)
        .with_events(args.events.as_ref().map(|path| EventWriter::new(path, "mosaic-cli")));
    let request = HostedRequest {
        prompt: args.prompt,
        model_id: args.model,
        aspect_ratio: args.aspect_ratio,
        resolution: args.resolution,
        reference_images: args.references,
    };
    let mut on_progress = |elapsed_ms: u64| {
        eprintln!("still generating ({}s elapsed)", elapsed_ms / 1000);
    };
    let image = generator.generate(&request, Some(&mut on_progress))?;
    println!("{}", image.image_url);
    Ok(0)
}

fn run_templates(config: &Config, command: TemplatesCommand) -> Result<i32> {
    let store = TemplateStore::new(&config.templates_dir);
    match command {
        TemplatesCommand::List => {
            let names = store.list();
            if names.is_empty() {
                println!("No templates in {}", store.dir().display());
            }
            for name in names {
                let marker = if config.default_template.as_deref() == Some(name.as_str()) {
                    " (default)"
                } else {
                    ""
                };
                let summary = store.load(&name).map(|graph| summarize(&graph));
                match summary {
                    Ok(summary) => println!(
                        "{name}{marker}: {} nodes, {}x{}, checkpoint {}",
                        summary.node_count,
                        summary.width.map(|w| w.to_string()).unwrap_or_else(|| "?".into()),
                        summary.height.map(|h| h.to_string()).unwrap_or_else(|| "?".into()),
                        summary.checkpoint.as_deref().unwrap_or("?"),
                    ),
                    Err(err) => println!("{name}{marker}: unreadable ({err:#})"),
                }
            }
        }
        TemplatesCommand::Show { name } => {
            let graph = store.load(&name)?;
            println!("{}", describe_editable_nodes(&graph)?);
        }
        TemplatesCommand::Import { name, path } => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            let graph = Graph::from_json_str(&raw)?;
            if let Err(err) = infer_roles(&graph) {
                eprintln!("warning: {err}; generation with this template will fail");
            }
            let saved = store.save(&name, &graph)?;
            println!("Imported {name} ({} nodes) to {}", graph.len(), saved.display());
        }
        TemplatesCommand::Delete { name } => {
            store.delete(&name)?;
            println!("Deleted {name}");
        }
        TemplatesCommand::Set {
            name,
            node,
            input,
            value,
        } => {
            let mut graph = store.load(&name)?;
            let parsed = parse_input_value(&value);
            graph.set_input(&node, &input, parsed.clone())?;
            store.save(&name, &graph)?;
            println!("{name}: node {node} {input} = {parsed}");
        }
    }
    Ok(0)
}

fn parse_input_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn run_check(config: &Config) -> Result<i32> {
    let client = HttpEngineClient::new(&config.engine_url);
    let store = TemplateStore::new(&config.templates_dir);
    println!("engine: {}", client.base_url());
    println!("templates: {}", store.dir().display());
    println!("max concurrent jobs: {}", config.max_concurrent_jobs);
    println!(
        "hosted: {} (token {})",
        config.hosted_base_url,
        if config.hosted_api_token.is_some() { "set" } else { "missing" }
    );
    println!("available templates: {}", available_templates(&store));

    match client.check_connection() {
        Ok(()) => {
            let checkpoints = client.list_checkpoints();
            println!("engine reachable, {} checkpoints", checkpoints.len());
            for name in checkpoints {
                println!("  {name}");
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("engine unreachable: {err:#}");
            Ok(2)
        }
    }
}

fn available_templates(store: &TemplateStore) -> String {
    let names = store.list();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_values_parse_as_json_then_text() {
        assert_eq!(parse_input_value("30"), serde_json::json!(30));
        assert_eq!(parse_input_value("7.5"), serde_json::json!(7.5));
        assert_eq!(parse_input_value("true"), serde_json::json!(true));
        assert_eq!(parse_input_value("euler_ancestral"), serde_json::json!("euler_ancestral"));
    }

    #[test]
    fn cli_parses_repeated_references() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "mosaic",
            "generate",
            "--prompt",
            "a red fox",
            "--template",
            "txt2img",
            "--reference",
            "https://x/a.png",
            "--reference",
            "https://x/b.png",
            "--out",
            "fox.png",
            "--dryrun",
        ])?;
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.references.len(), 2);
                assert!(args.dryrun);
                assert_eq!(args.template.as_deref(), Some("txt2img"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn dryrun_image_lands_in_output_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = GeneratedImage {
            job_id: "dryrun-abc".to_string(),
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
            warning: None,
            seed: Some(4),
        };
        let path = write_image(temp.path(), &image)?;
        assert_eq!(path, temp.path().join("dryrun-abc.png"));
        let nested = write_image(&temp.path().join("a/b/out.png"), &image)?;
        assert_eq!(fs::read(nested)?, vec![1, 2, 3]);
        assert_eq!(display_seed(&image), "4");
        Ok(())
    }
}
