//! package-tool: build, validate, and inspect packages; manage repository
//! index files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use pko_packages::build::{image_files, lock_to_yaml, resolve_lock};
use pko_packages::fixtures::run_template_tests;
use pko_packages::render::render_package;
use pko_packages::validate::{load_package, validate_package, validation_contexts, Violation};
use pko_packages::{Package, RawPackage};
use pko_registry::{AnonymousCredentials, HttpRegistry, PackagePusher};
use pko_repository::{parse_version, Data, RepositoryIndex};

#[derive(Parser, Debug)]
#[command(name = "package-tool", version, about = "Package operator tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate and pack a package source directory into an OCI image
    Build {
        /// Package source directory
        src: PathBuf,
        /// Image tags to apply (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Write the image as a tar file
        #[arg(long = "output")]
        output: Option<PathBuf>,
        /// Push to the registry after building
        #[arg(long = "push", action = ArgAction::SetTrue)]
        push: bool,
        /// Use plain HTTP for registry access (test registries)
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
    /// Validate a source directory, image tarball, or pulled image
    Validate {
        /// Directory, tarball path, or (with --pull) an image reference
        target: String,
        /// Treat target as an image reference and pull it
        #[arg(long = "pull", action = ArgAction::SetTrue)]
        pull: bool,
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
    /// Resolve current image digests and rewrite the lock file
    Update {
        src: PathBuf,
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
    /// Print the rendered object tree of a package
    Tree {
        src: PathBuf,
        /// Render for cluster scope
        #[arg(long = "cluster", action = ArgAction::SetTrue)]
        cluster: bool,
        /// Read the instance configuration from a YAML file
        #[arg(long = "config-path", conflicts_with = "config_testcase")]
        config_path: Option<PathBuf>,
        /// Use the context of a template test case
        #[arg(long = "config-testcase")]
        config_testcase: Option<String>,
    },
    /// Manage a repository index file
    Repository {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand, Debug)]
enum RepoCommands {
    /// Create an empty index
    Init { file: PathBuf, name: String },
    /// Add or update a package record
    Add {
        file: PathBuf,
        image: String,
        /// Versions published under this digest
        versions: Vec<String>,
        /// Package name; defaults to the image repository basename
        #[arg(long = "name")]
        name: Option<String>,
        /// Image digest; resolved from the registry when omitted
        #[arg(long = "digest")]
        digest: Option<String>,
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
    /// Remove a package record
    Remove {
        file: PathBuf,
        package: String,
        /// Digest to remove; all records of the package when omitted
        #[arg(long = "digest")]
        digest: Option<String>,
    },
    /// Pull an index image into a local file
    Pull {
        file: PathBuf,
        reference: String,
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
    /// Push a local index file as an image
    Push {
        file: PathBuf,
        reference: String,
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("PKO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PKO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PKO_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn registry(insecure: bool) -> HttpRegistry {
    HttpRegistry::new(Box::new(AnonymousCredentials), insecure)
}

/// Fail with every violation, one per line.
fn check_violations(violations: Vec<Violation>) -> Result<()> {
    if violations.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = violations.iter().map(ToString::to_string).collect();
    bail!("package validation failed\n{}", lines.join("\n"))
}

/// Load and fully validate a source directory, fixtures included.
fn load_source_dir(src: &Path) -> Result<Package> {
    let raw = RawPackage::from_folder(src)
        .with_context(|| format!("reading package at {}", src.display()))?;
    let package = match load_package(&raw) {
        Ok(p) => p,
        Err(e) => bail!("package validation failed\n{e}"),
    };
    let mut violations = validate_package(&package);
    violations.extend(run_template_tests(src, &package)?);
    check_violations(violations)?;
    Ok(package)
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build { src, tags, output, push, insecure } => {
            let package = load_source_dir(&src)?;
            let files = image_files(&package, None);
            if let Some(path) = &output {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("creating {}", path.display()))?;
                let digest = pko_registry::oci::write_image_tar(file, &files)?;
                println!("wrote {} ({digest})", path.display());
            }
            if push {
                if tags.is_empty() {
                    bail!("--push requires at least one --tag");
                }
                let reg = registry(insecure);
                check_lock_digests(&package, &reg).await?;
                let digest = reg.push(&tags, &files).await?;
                println!("pushed {} ({digest})", tags.join(", "));
            }
            info!(package = %package.manifest.metadata.name, "build finished");
            Ok(())
        }
        Commands::Validate { target, pull, insecure } => {
            if pull {
                let raw = RawPackage::from_image(&registry(insecure), &target).await?;
                let package = match load_package(&raw) {
                    Ok(p) => p,
                    Err(e) => bail!("package validation failed\n{e}"),
                };
                check_violations(validate_package(&package))?;
            } else {
                let path = PathBuf::from(&target);
                if path.is_file() {
                    let file = std::fs::File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    let files = pko_registry::oci::read_image_tar(file)?;
                    let raw = RawPackage::from_files(files)?;
                    let package = match load_package(&raw) {
                        Ok(p) => p,
                        Err(e) => bail!("package validation failed\n{e}"),
                    };
                    check_violations(validate_package(&package))?;
                } else {
                    load_source_dir(&path)?;
                }
            }
            println!("validation OK");
            Ok(())
        }
        Commands::Update { src, insecure } => {
            let raw = RawPackage::from_folder(&src)?;
            let package = match load_package(&raw) {
                Ok(p) => p,
                Err(e) => bail!("package validation failed\n{e}"),
            };
            let reg = registry(insecure);
            match resolve_lock(&package.manifest, package.lock.as_ref(), &reg).await? {
                Some(lock) => {
                    let path = src.join(pko_packages::LOCK_FILE);
                    std::fs::write(&path, lock_to_yaml(&lock)?)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("lock file updated");
                }
                None => println!("lock file already up to date"),
            }
            Ok(())
        }
        Commands::Tree { src, cluster, config_path, config_testcase } => {
            let package = load_source_dir(&src)?;
            let mut ctx = pick_context(&package, config_testcase.as_deref())?;
            if let Some(path) = config_path {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let yaml: serde_yaml::Value = serde_yaml::from_str(&text)?;
                ctx.config = Some(serde_json::to_value(yaml)?);
            }
            if cluster {
                ctx.package.namespace = None;
            }
            print_tree(&package, &ctx)?;
            Ok(())
        }
        Commands::Repository { command } => run_repository(command).await,
    }
}

/// A stale lock must not ship: every locked digest has to match the
/// registry before push.
async fn check_lock_digests(package: &Package, reg: &HttpRegistry) -> Result<()> {
    use pko_registry::PackagePuller;
    let Some(lock) = &package.lock else { return Ok(()) };
    for image in &lock.spec.images {
        let current = reg
            .head_digest(&image.image)
            .await
            .with_context(|| format!("resolving {}", image.image))?;
        if current != image.digest {
            bail!(
                "lock file is stale: {} is {} in the registry, {} in the lock; run `package-tool update` first",
                image.image,
                current,
                image.digest
            );
        }
    }
    Ok(())
}

fn pick_context(
    package: &Package,
    testcase: Option<&str>,
) -> Result<pko_apis::manifests::TemplateContext> {
    match testcase {
        Some(name) => package
            .manifest
            .test
            .as_ref()
            .and_then(|t| t.template.iter().find(|c| c.name == name))
            .map(|c| c.context.clone())
            .ok_or_else(|| anyhow!("template test case {name:?} not found")),
        None => Ok(validation_contexts(&package.manifest)
            .into_iter()
            .next()
            .expect("validation_contexts is never empty")),
    }
}

fn print_tree(package: &Package, ctx: &pko_apis::manifests::TemplateContext) -> Result<()> {
    let (instance, _) =
        render_package(&package.manifest, package.lock.as_ref(), &package.files, ctx)?;
    println!("{}", ctx.package.name);
    for phase in &instance.manifest.spec.phases {
        let objects = instance.phase_objects(&phase.name);
        if objects.is_empty() {
            continue;
        }
        println!("Phase {}", phase.name);
        for obj in objects {
            let gvk = pko_core::object::gvk_of(obj)?;
            let ns = pko_core::object::namespace_of(obj)
                .or(ctx.package.namespace.as_deref())
                .unwrap_or("");
            let name = pko_core::object::name_of(obj).unwrap_or("");
            println!("  {} {}/{}", gvk, ns, name);
        }
    }
    for (name, component) in &package.components {
        let mut sub_ctx = ctx.clone();
        sub_ctx.package.name = format!("{}-{}", ctx.package.name, name);
        println!();
        print_tree(component, &sub_ctx)?;
    }
    Ok(())
}

async fn run_repository(command: RepoCommands) -> Result<()> {
    match command {
        RepoCommands::Init { file, name } => {
            RepositoryIndex::init(&name).save(&file)?;
            println!("initialized {} as {name}", file.display());
            Ok(())
        }
        RepoCommands::Add { file, image, versions, name, digest, insecure } => {
            let mut index = RepositoryIndex::load(&file)?;
            let parsed: Result<Vec<_>, _> = versions.iter().map(|v| parse_version(v)).collect();
            let package_name = name.unwrap_or_else(|| image_basename(&image));
            let digest = match digest {
                Some(d) => d,
                None => {
                    use pko_registry::PackagePuller;
                    registry(insecure).head_digest(&image).await?
                }
            };
            index.add(Data {
                name: package_name.clone(),
                image,
                digest,
                versions: parsed?,
                constraints: Vec::new(),
            })?;
            index.save(&file)?;
            println!("added {package_name} ({} entries)", index.len());
            Ok(())
        }
        RepoCommands::Remove { file, package, digest } => {
            let mut index = RepositoryIndex::load(&file)?;
            match digest {
                Some(d) => index.remove(&package, &d)?,
                None => {
                    // remove every digest of the package
                    let digests: Vec<String> = index
                        .get_digests(&package)?
                        .into_iter()
                        .map(String::from)
                        .collect();
                    for d in digests {
                        index.remove(&package, &d)?;
                    }
                }
            }
            index.save(&file)?;
            println!("removed {package} ({} entries remain)", index.len());
            Ok(())
        }
        RepoCommands::Pull { file, reference, insecure } => {
            let reg = registry(insecure);
            let index = RepositoryIndex::pull(&reg, &reference).await?;
            index.save(&file)?;
            println!("pulled {reference} into {}", file.display());
            Ok(())
        }
        RepoCommands::Push { file, reference, insecure } => {
            let index = RepositoryIndex::load(&file)?;
            let reg = registry(insecure);
            let digest = index.push(&reg, &[reference.clone()]).await?;
            println!("pushed {reference} ({digest})");
            Ok(())
        }
    }
}

fn image_basename(image: &str) -> String {
    let no_digest = image.split('@').next().unwrap_or(image);
    let no_tag = match no_digest.rsplit_once(':') {
        Some((rest, tag)) if !tag.contains('/') => rest,
        _ => no_digest,
    };
    no_tag.rsplit('/').next().unwrap_or(no_tag).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_basename_strips_registry_tag_and_digest() {
        assert_eq!(image_basename("quay.io/ns/app:v1"), "app");
        assert_eq!(image_basename("localhost:5000/app"), "app");
        assert_eq!(image_basename("quay.io/ns/app@sha256:abc"), "app");
    }
}
