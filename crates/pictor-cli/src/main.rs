use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pictor_artifact::ProviderPreference;
use pictor_cache::GenerationCache;
use pictor_core::{GenerationStatus, JsonLinesSink, Orchestrator, PictorConfig};
use pictor_resource::{NvidiaSmiProbe, ResourceManager};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file")
}

fn cli() -> Command {
    Command::new("pictor")
        .version(pictor_core::VERSION)
        .about("GPU-memory-aware image generation with quality-gated retries")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("generate")
                .about("Generate one image")
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .required(true)
                        .help("Text prompt"),
                )
                .arg(
                    Arg::new("negative")
                        .long("negative")
                        .help("Negative prompt"),
                )
                .arg(
                    Arg::new("width")
                        .long("width")
                        .value_parser(value_parser!(u32))
                        .help("Image width in pixels"),
                )
                .arg(
                    Arg::new("height")
                        .long("height")
                        .value_parser(value_parser!(u32))
                        .help("Image height in pixels"),
                )
                .arg(
                    Arg::new("steps")
                        .long("steps")
                        .value_parser(value_parser!(u32))
                        .help("Inference steps"),
                )
                .arg(
                    Arg::new("guidance")
                        .long("guidance")
                        .value_parser(value_parser!(f32))
                        .help("Guidance scale"),
                )
                .arg(Arg::new("style").long("style").help("Style preset name"))
                .arg(
                    Arg::new("provider")
                        .long("provider")
                        .value_parser(["auto", "local", "remote", "local_only", "remote_only"])
                        .help("Provider preference"),
                )
                .arg(
                    Arg::new("max-retries")
                        .long("max-retries")
                        .value_parser(value_parser!(u32))
                        .help("Regenerations allowed after the first attempt"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Seed for reproducible local runs"),
                )
                .arg(config_arg())
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Where to write the image"),
                )
                .arg(
                    Arg::new("record")
                        .long("record")
                        .value_parser(value_parser!(PathBuf))
                        .help("Append a JSON record of the result to this file"),
                ),
        )
        .subcommand(
            Command::new("vram")
                .about("Sample GPU memory")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("cache")
                .about("Inspect or clear the image cache")
                .subcommand_required(true)
                .subcommand(Command::new("stats").about("Print cache statistics").arg(config_arg()))
                .subcommand(Command::new("clear").about("Remove every cached image").arg(config_arg())),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<PictorConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => PictorConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(PictorConfig::default()),
    }
}

async fn generate(args: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(args)?;
    let prompt = args
        .get_one::<String>("prompt")
        .context("--prompt is required")?;

    let mut request = config.generation.request(prompt.as_str());
    if let Some(negative) = args.get_one::<String>("negative") {
        request = request.with_negative_prompt(negative.as_str());
    }
    let width = args.get_one::<u32>("width").copied().unwrap_or(request.width);
    let height = args.get_one::<u32>("height").copied().unwrap_or(request.height);
    request = request.with_size(width, height);
    if let Some(&steps) = args.get_one::<u32>("steps") {
        request = request.with_steps(steps);
    }
    if let Some(&guidance) = args.get_one::<f32>("guidance") {
        request = request.with_guidance_scale(guidance);
    }
    if let Some(style) = args.get_one::<String>("style") {
        request = request.with_style(style.as_str());
    }
    if let Some(provider) = args.get_one::<String>("provider") {
        request = request.with_provider_preference(provider.parse::<ProviderPreference>()?);
    }
    if let Some(&retries) = args.get_one::<u32>("max-retries") {
        request = request.with_max_retries(retries);
    }
    if let Some(&seed) = args.get_one::<u64>("seed") {
        request = request.with_seed(seed);
    }

    let mut orchestrator = Orchestrator::from_config(config).await?;
    if let Some(path) = args.get_one::<PathBuf>("record") {
        orchestrator = orchestrator.with_sink(Arc::new(JsonLinesSink::new(path)));
    }

    let outcome = orchestrator.generate(request).await;
    orchestrator.shutdown().await;
    let result = outcome?;

    if let Some(image) = &result.image {
        let out = args.get_one::<PathBuf>("out").cloned().unwrap_or_else(|| {
            PathBuf::from(format!(
                "pictor-{}.{}",
                result.fingerprint.short(),
                image.media_type().extension()
            ))
        });
        tokio::fs::write(&out, image.bytes())
            .await
            .with_context(|| format!("writing image to {}", out.display()))?;
        info!(path = %out.display(), "image written");
    } else {
        warn!(status = %result.final_status, "no image produced");
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.final_status == GenerationStatus::Validated {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn vram(args: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(args)?;
    let manager = ResourceManager::new(
        config.resource.clone(),
        Arc::new(NvidiaSmiProbe::new(config.resource.gpu_index)),
    );
    let status = manager.device_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(ExitCode::SUCCESS)
}

async fn cache(args: &ArgMatches) -> Result<ExitCode> {
    let Some((action, sub)) = args.subcommand() else {
        return Ok(ExitCode::FAILURE);
    };
    let config = load_config(sub)?;
    let cache = GenerationCache::open(config.cache).await?;
    match action {
        "clear" => {
            let removed = cache.clear().await;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
        _ => println!("{}", serde_json::to_string_pretty(&cache.stats().await)?),
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("generate", args)) => generate(args).await,
        Some(("vram", args)) => vram(args).await,
        Some(("cache", args)) => cache(args).await,
        _ => Ok(ExitCode::FAILURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn generate_accepts_every_override() {
        let matches = cli()
            .try_get_matches_from([
                "pictor",
                "generate",
                "--prompt",
                "isometric view of a rack of servers",
                "--width",
                "768",
                "--guidance",
                "4.5",
                "--provider",
                "remote_only",
                "--max-retries",
                "1",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "generate");
        assert_eq!(args.get_one::<u32>("width"), Some(&768));
        assert_eq!(args.get_one::<f32>("guidance"), Some(&4.5));
        assert_eq!(args.get_one::<String>("provider").unwrap(), "remote_only");
        assert!(args.get_one::<PathBuf>("config").is_none());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = cli()
            .try_get_matches_from([
                "pictor",
                "generate",
                "--prompt",
                "isometric view of a rack of servers",
                "--provider",
                "mainframe",
            ])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn cache_requires_an_action() {
        assert!(cli().try_get_matches_from(["pictor", "cache"]).is_err());
        assert!(cli()
            .try_get_matches_from(["pictor", "cache", "stats", "--config", "pictor.toml"])
            .is_ok());
    }
}
