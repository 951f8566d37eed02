use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repo_sentinel_core::{
    analyzer::{AnalyzerOptions, CostPreview, LlmAnalyzer},
    build_provider, build_scanner, default_encoder, render_summary, write_token_report,
    AppConfig, GithubSource, LlmProvider, Manifest, ManifestStore, Phase, PhaseController,
    RepoSource, RepositoryInfo, SentinelError, TokenAccountant, VulnScanner,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "repo-sentinel",
    author,
    version,
    about = "Repository risk analysis: inventory, LLM classification, vulnerability scan, risk scoring"
)]
struct Cli {
    /// Configuration file (TOML/YAML/JSON)
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the requested analysis phases and write the manifest.
    Analyze {
        repo_url: String,
        /// Phases to run (1, 1.5, 2.5, 3); repeatable or comma separated.
        #[arg(long = "phase", value_delimiter = ',', default_values_t = vec!["1".to_string()])]
        phases: Vec<String>,
        /// LLM provider for classification (openai, bedrock).
        #[arg(long)]
        provider: Option<String>,
        /// Manifest output path (defaults to the configured output dir).
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Shorthand for including phase 3.
        #[arg(long)]
        scan_vulnerabilities: bool,
        /// Scanners to run (defaults to all enabled in config).
        #[arg(long, value_delimiter = ',')]
        scanners: Option<Vec<String>>,
        /// Skip the sampled cost preview and its consent prompt.
        #[arg(long)]
        skip_cost_preview: bool,
        /// Re-classify files that already carry a purpose.
        #[arg(long)]
        reanalyze: bool,
    },
    /// Print a human summary of an existing manifest.
    Show { manifest_path: PathBuf },
    /// Verify source API access.
    TestConnection,
    /// Verify an LLM provider end to end.
    TestLlm {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Verify the configured vulnerability scanners are installed.
    TestVulnerabilityScanner,
    /// Run only the sampling-based cost estimate.
    CostPreview {
        repo_url: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = 3)]
        sample_size: usize,
    },
    /// Standalone token accounting over an existing manifest.
    AnalyzeTokens {
        manifest_path: PathBuf,
        #[arg(long)]
        provider: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<SentinelError>()
                .map(SentinelError::exit_code)
                .unwrap_or(1);
            process::exit(code);
        }
    }
}

async fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config_file.as_deref())?;

    match cli.command {
        Commands::Analyze {
            repo_url,
            phases,
            provider,
            output,
            scan_vulnerabilities,
            scanners,
            skip_cost_preview,
            reanalyze,
        } => {
            analyze(
                &config,
                AnalyzeArgs {
                    repo_url,
                    phases,
                    provider,
                    output,
                    scan_vulnerabilities,
                    scanners,
                    skip_cost_preview,
                    reanalyze,
                },
            )
            .await
        }
        Commands::Show { manifest_path } => {
            let manifest = ManifestStore::new(&manifest_path).load()?;
            println!("{}", render_summary(&manifest));
            Ok(0)
        }
        Commands::TestConnection => test_connection(&config).await,
        Commands::TestLlm { provider } => test_llm(&config, provider.as_deref()).await,
        Commands::TestVulnerabilityScanner => test_scanners(&config).await,
        Commands::CostPreview {
            repo_url,
            provider,
            sample_size,
        } => cost_preview(&config, &repo_url, provider.as_deref(), sample_size).await,
        Commands::AnalyzeTokens {
            manifest_path,
            provider,
        } => analyze_tokens(&config, &manifest_path, provider.as_deref()).await,
    }
}

struct AnalyzeArgs {
    repo_url: String,
    phases: Vec<String>,
    provider: Option<String>,
    output: Option<PathBuf>,
    scan_vulnerabilities: bool,
    scanners: Option<Vec<String>>,
    skip_cost_preview: bool,
    reanalyze: bool,
}

async fn analyze(config: &AppConfig, args: AnalyzeArgs) -> Result<i32> {
    let mut phases = args
        .phases
        .iter()
        .map(|p| Phase::parse(p))
        .collect::<Result<Vec<_>, _>>()?;
    if args.scan_vulnerabilities && !phases.contains(&Phase::VulnerabilityAndRisk) {
        phases.push(Phase::VulnerabilityAndRisk);
    }

    let output = args.output.unwrap_or_else(|| {
        Path::new(&config.output.default_dir).join(&config.output.manifest_filename)
    });
    let store = ManifestStore::new(&output);
    let source: Arc<dyn RepoSource> =
        Arc::new(GithubSource::new(&config.source, &args.repo_url)?);

    let provider_name = args
        .provider
        .as_deref()
        .unwrap_or(&config.llm.default_provider)
        .to_string();
    let accountant = TokenAccountant::new(
        default_encoder(),
        config.llm.provider_settings(&provider_name)?,
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let mut analyzer_options = AnalyzerOptions::from_config(config);
    analyzer_options.reanalyze = args.reanalyze;

    let mut controller = PhaseController::new(
        config.clone(),
        store.clone(),
        Arc::clone(&source),
        &args.repo_url,
        accountant,
    )
    .with_analyzer_options(analyzer_options)
    .with_consent(Box::new(prompt_consent))
    .skip_cost_preview(args.skip_cost_preview)
    .with_cancel(cancel);

    if phases.contains(&Phase::Classification) {
        let (primary, fallback) = build_providers(config, &provider_name).await?;
        controller = controller.with_providers(primary, fallback);
    }
    if phases.contains(&Phase::VulnerabilityAndRisk) {
        controller = controller.with_scanners(requested_scanners(config, args.scanners.as_deref())?);
    }

    controller.run(&phases).await?;

    let manifest = store.load()?;
    println!("Analysis complete. Manifest written to {}", output.display());
    println!("{}", render_summary(&manifest));
    Ok(0)
}

async fn build_providers(
    config: &AppConfig,
    primary_name: &str,
) -> Result<(Arc<dyn LlmProvider>, Option<Arc<dyn LlmProvider>>)> {
    let primary = build_provider(primary_name, config).await?;
    let fallback = match config.llm.fallback_for(primary_name) {
        Some(name) => match build_provider(name, config).await {
            Ok(provider) => Some(provider),
            Err(err) => {
                warn!("secondary provider `{name}` unavailable: {err}");
                None
            }
        },
        None => None,
    };
    Ok((primary, fallback))
}

fn requested_scanners(
    config: &AppConfig,
    requested: Option<&[String]>,
) -> Result<Vec<Box<dyn VulnScanner>>> {
    let names: Vec<String> = match requested {
        Some(names) => names.to_vec(),
        None => config
            .vulnerability_scanning
            .scanners
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(name, _)| name.clone())
            .collect(),
    };
    names.iter().map(|name| build_scanner(name)).collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn prompt_consent(preview: &CostPreview) -> bool {
    println!("{}", format_preview(preview));
    print!("Proceed with classification? [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn format_preview(preview: &CostPreview) -> String {
    format!(
        "Cost preview ({} provider)\n\
         Files to classify: {}\n\
         Sampled: {}\n\
         Projected input tokens: {}\n\
         Projected output tokens: {}\n\
         Projected cost: ${:.4} (95% band ${:.4} - ${:.4})",
        preview.provider,
        preview.candidate_count,
        preview.sample_size,
        preview.projected_input_tokens,
        preview.projected_output_tokens,
        preview.projected_cost_usd,
        preview.cost_low_usd,
        preview.cost_high_usd,
    )
}

async fn test_connection(config: &AppConfig) -> Result<i32> {
    // rate-limit endpoint needs no repository; any parseable repo path works
    let source = GithubSource::new(&config.source, "octocat/hello-world")?;
    let status = source
        .check_access()
        .await
        .context("source API unreachable")?;
    println!("Source connection OK");
    println!("Rate limit remaining: {}/{}", status.remaining, status.limit);
    Ok(0)
}

async fn test_llm(config: &AppConfig, provider: Option<&str>) -> Result<i32> {
    let name = provider.unwrap_or(&config.llm.default_provider);
    let provider = build_provider(name, config).await?;
    println!("Checking provider {name}...");
    provider.test_connection().await?;
    println!("  ok ({})", provider.model());
    Ok(0)
}

async fn test_scanners(config: &AppConfig) -> Result<i32> {
    let mut failed = false;
    for (name, settings) in &config.vulnerability_scanning.scanners {
        if !settings.enabled {
            println!("{name}: disabled");
            continue;
        }
        let scanner = build_scanner(name)?;
        match scanner.ensure_available(false).await {
            Ok(()) => println!("{name}: ok"),
            Err(err) => {
                failed = true;
                println!("{name}: unavailable ({err})");
            }
        }
    }
    Ok(if failed { 1 } else { 0 })
}

async fn cost_preview(
    config: &AppConfig,
    repo_url: &str,
    provider: Option<&str>,
    sample_size: usize,
) -> Result<i32> {
    let source: Arc<dyn RepoSource> = Arc::new(GithubSource::new(&config.source, repo_url)?);
    let provider_name = provider.unwrap_or(&config.llm.default_provider);
    let llm = build_provider(provider_name, config).await?;
    let accountant = TokenAccountant::new(
        default_encoder(),
        config.llm.provider_settings(provider_name)?,
    );

    // transient in-memory inventory; nothing is written
    let head = source.resolve().await?;
    let files = source.list_files(&head.commit_sha).await?;
    let mut manifest = Manifest::new(RepositoryInfo {
        url: repo_url.to_string(),
        default_branch: head.default_branch,
        commit_sha: head.commit_sha,
        analysis_timestamp: String::new(),
    });
    manifest.merge_inventory(
        files
            .into_iter()
            .map(|file| repo_sentinel_core::InventoryRecord {
                extension: repo_sentinel_core::source::extension_of(&file.path),
                path: file.path,
                blob_id: file.blob_id,
                size: file.size,
            })
            .collect(),
    );

    let mut options = AnalyzerOptions::from_config(config);
    options.sample_size = sample_size;
    let analyzer = LlmAnalyzer::new(
        source,
        llm,
        None,
        accountant,
        options,
        CancellationToken::new(),
    );
    let preview = analyzer.cost_preview(&manifest).await?;
    println!("{}", format_preview(&preview));
    Ok(0)
}

async fn analyze_tokens(
    config: &AppConfig,
    manifest_path: &Path,
    provider: Option<&str>,
) -> Result<i32> {
    let store = ManifestStore::new(manifest_path);
    let mut manifest = store.load()?;

    let provider_name = provider.unwrap_or(&config.llm.default_provider);
    let settings = config.llm.provider_settings(provider_name)?;
    let encoder = default_encoder();
    let encoder_name = encoder.name().to_string();
    let accountant = TokenAccountant::new(encoder, settings);
    let source = GithubSource::new(&config.source, &manifest.repository.url)?;

    let targets: Vec<(String, String, String)> = manifest
        .files
        .iter()
        .filter(|entry| config.is_analyzable(&entry.extension, entry.size))
        .map(|e| (e.path.clone(), e.extension.clone(), e.blob_id.clone()))
        .collect();
    for (path, extension, blob_id) in targets {
        let bytes = source.fetch_blob(&blob_id).await?;
        let stats = accountant.account(&path, &extension, &bytes);
        manifest.merge_patch(
            &path,
            repo_sentinel_core::EntryPatch {
                token_stats: Some(stats),
                ..Default::default()
            },
        );
    }
    store.save(&manifest)?;

    let aggregate = repo_sentinel_core::RepoTokenStats::aggregate(&manifest);
    let report_path = manifest_path.with_extension("tokens.json");
    write_token_report(&report_path, &manifest, &aggregate, &encoder_name, settings)?;

    println!("Token analysis for {} files", aggregate.analyzed_files);
    println!("Total tokens: {}", aggregate.total_tokens);
    println!("Estimated cost: ${:.4}", aggregate.estimated_total_cost_usd);
    println!("Report written to {}", report_path.display());
    Ok(0)
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; finishing in-flight work and saving progress...");
            cancel.cancel();
        }
    });
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
