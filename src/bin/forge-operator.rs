//! forge-operator - ReleaseDeployment controller and deployment tooling
//!
//! ## Usage
//!
//! ```sh
//! forge-operator run [--config <path>]
//! forge-operator crd
//! forge-operator pull <image-ref> <dest> [--store <dir>]
//! forge-operator render <bundle.cue> [--root <dir>] [--project <name>]
//! forge-operator version
//! ```
//!
//! `run` reads its config from `--config` or `FORGE_OPERATOR_CONFIG`.

use anyhow::Context;
use forge_deployer::config::OperatorConfig;
use forge_deployer::constants::CACHE_NAMESPACE;
use forge_deployer::controller::{ControllerContext, run_controller};
use forge_deployer::credentials::DockerCredentials;
use forge_deployer::exec::{CommandRunner, LocalCommandRunner};
use forge_deployer::logs::{LogOptions, init_logging};
use forge_deployer::secrets::{LocalSecretStore, resolve_token};
use forge_deployer::verify::VerifierRegistry;
use forge_deployer::{
    CachedRepos, ContentStore, DeployTarget, Deployer, Git2Remote, GitAuth, GitRemote, GeneratorDeps,
    GeneratorRegistry, HttpReleaseApi, KubeResources, ModuleBundle, OciPuller, Puller, Reconciler, RemoteRegistry,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        config: Option<PathBuf>,
    },
    Crd,
    Pull {
        image: String,
        dest: PathBuf,
        store: Option<PathBuf>,
    },
    Render {
        bundle: PathBuf,
        root: String,
        project: String,
    },
    Version,
    Help,
}

/// Value following `flag`, if present.
fn flag_value(args: &[String], names: &[&str]) -> Result<Option<String>, String> {
    match args.iter().position(|a| names.contains(&a.as_str())) {
        Some(i) => args
            .get(i + 1)
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("{} requires a value", names[0])),
        None => Ok(None),
    }
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "run" => Ok(Command::Run {
            config: flag_value(&args, &["--config", "-c"])?.map(PathBuf::from),
        }),
        "crd" => Ok(Command::Crd),
        "pull" => {
            if args.len() < 4 {
                return Err("pull requires <image-ref> <dest>".to_string());
            }
            Ok(Command::Pull {
                image: args[2].clone(),
                dest: PathBuf::from(&args[3]),
                store: flag_value(&args, &["--store"])?.map(PathBuf::from),
            })
        }
        "render" => {
            if args.len() < 3 {
                return Err("render requires <bundle.cue>".to_string());
            }
            Ok(Command::Render {
                bundle: PathBuf::from(&args[2]),
                root: flag_value(&args, &["--root", "-r"])?.unwrap_or_else(|| "root".to_string()),
                project: flag_value(&args, &["--project", "-p"])?.unwrap_or_else(|| "project".to_string()),
            })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Wiring
// =============================================================================

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_NAMESPACE)
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn build_puller(store_dir: &Path, config: Option<&OperatorConfig>, runner: Arc<dyn CommandRunner>) -> anyhow::Result<OciPuller> {
    let store = Arc::new(ContentStore::open(store_dir)?);
    let credentials = DockerCredentials::load_default().context("failed to read docker config")?;
    let mut puller = OciPuller::new(store, Arc::new(RemoteRegistry::new())).with_credentials(credentials);

    if let Some(config) = config {
        puller = puller.with_limits(config.oci.limits());
        if let Some(opts) = &config.oci.verify {
            let verifier = VerifierRegistry::with_cosign(opts.clone(), runner).build("cosign")?;
            puller = puller.with_verifier(verifier);
        }
    }
    Ok(puller)
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = OperatorConfig::resolve_path(config)?;
    let config = OperatorConfig::load(&path)?;
    init_logging(&LogOptions::from(&config.log))?;

    let runner: Arc<dyn CommandRunner> = Arc::new(LocalCommandRunner::new());
    let git_remote: Arc<dyn GitRemote> = Arc::new(Git2Remote);
    let token = resolve_token(&LocalSecretStore, config.deployer.git.creds.as_ref());
    let auth = token.map(GitAuth::token);

    let puller = build_puller(&config.cache_dir.join("oci"), Some(&config), runner.clone())?;
    let generators = GeneratorRegistry::default_providers(GeneratorDeps {
        runner,
        puller: Arc::new(puller),
        git_remote: git_remote.clone(),
        git_auth: auth.clone(),
        kcl_binary: config.kcl.binary.clone(),
        kcl_cache: config.kcl_cache_path(),
        helm_binary: config.helm.binary.clone(),
        work_dir: config.work_dir.clone(),
    });
    let deployer = Deployer::new(Arc::new(generators), config.deployer.root_dir.clone());
    let repos = Arc::new(CachedRepos::new(config.cache_dir.clone(), git_remote));
    let api = HttpReleaseApi::new(&config.api.url, config.api_token())?;

    let target = DeployTarget {
        url: config.deployer.git.url.clone(),
        git_ref: config.deployer.git.git_ref.clone(),
        auth,
    };

    runtime()?.block_on(async move {
        let client = kube::Client::try_default()
            .await
            .context("failed to create kubernetes client")?;

        let reconciler = Reconciler::new(
            Arc::new(KubeResources::new(client.clone())),
            Arc::new(api),
            deployer,
            repos,
            target,
        )
        .with_max_attempts(config.max_attempts)
        .with_backoff(config.requeue_base(), config.requeue_max());

        let ctx = Arc::new(ControllerContext {
            reconciler,
            tick_timeout: config.tick_timeout(),
            shutdown: CancellationToken::new(),
        });
        run_controller(client, ctx).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_crd() -> anyhow::Result<()> {
    print!("{}", forge_deployer::crd::crd_yaml()?);
    Ok(())
}

fn cmd_pull(image: String, dest: PathBuf, store: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging(&LogOptions::default())?;
    let store_dir = store.unwrap_or_else(|| default_cache_dir().join("oci"));
    let puller = build_puller(&store_dir, None, Arc::new(LocalCommandRunner::new()))?;

    runtime()?.block_on(async {
        puller
            .pull(&CancellationToken::new(), &image, &dest)
            .await
            .with_context(|| format!("failed to pull {}", image))
    })?;

    eprintln!("Pulled {} into {}", image, dest.display());
    Ok(())
}

fn cmd_render(bundle: PathBuf, root: String, project: String) -> anyhow::Result<()> {
    init_logging(&LogOptions::default())?;
    let src = std::fs::read_to_string(&bundle).with_context(|| format!("failed to read {}", bundle.display()))?;
    let mut parsed = ModuleBundle::parse(&src)?;
    parsed.apply_defaults(None);

    let runner: Arc<dyn CommandRunner> = Arc::new(LocalCommandRunner::new());
    let cache = default_cache_dir();
    let puller = build_puller(&cache.join("oci"), None, runner.clone())?;
    let generators = GeneratorRegistry::default_providers(GeneratorDeps {
        runner,
        puller: Arc::new(puller),
        git_remote: Arc::new(Git2Remote),
        git_auth: None,
        kcl_binary: "kcl".to_string(),
        kcl_cache: cache.join("kcl"),
        helm_binary: "helm".to_string(),
        work_dir: std::env::temp_dir().join("forge-render"),
    });
    let deployer = Deployer::new(Arc::new(generators), root);
    let dir = deployer.project_path(&project, &parsed)?;

    let rendered = runtime()?.block_on(deployer.render(&CancellationToken::new(), &parsed, None))?;

    println!("# {}/bundle.cue", dir);
    print!("{}", rendered.source);
    for (key, manifest) in &rendered.manifests {
        println!("---");
        println!("# {}/{}.yaml", dir, key);
        println!("{}", String::from_utf8_lossy(manifest).trim_end());
    }
    Ok(())
}

fn cmd_version() {
    println!("forge-operator version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"forge-operator - GitOps deployment operator for ReleaseDeployments

USAGE:
    forge-operator <command> [options]

COMMANDS:
    run [--config <path>]               Run the controller
    crd                                 Print the ReleaseDeployment CRD (YAML)
    pull <image-ref> <dest>             Pull an OCI artifact into a directory
    render <bundle.cue>                 Render a bundle without committing
    version                             Show version info
    help                                Show this help

OPTIONS:
    --config, -c <path>    Operator config (default: $FORGE_OPERATOR_CONFIG)
    --store <dir>          Content store for pull (default: <cache>/forge/oci)
    --root, -r <dir>       Deploy root for render (default: root)
    --project, -p <name>   Project name for render (default: project)
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Run { config } => cmd_run(config),
                Command::Crd => cmd_crd(),
                Command::Pull { image, dest, store } => cmd_pull(image, dest, store),
                Command::Render { bundle, root, project } => cmd_render(bundle, root, project),
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
