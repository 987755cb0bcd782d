//! Image Builder: turns a `Cartefile` into a packaged, cataloged image.
//!
//! The base image is unpacked into a scratch root, then each instruction is
//! applied in order. Every instruction after `FROM` yields exactly one layer:
//! a diff of the scratch root for `WORKDIR`, `COPY`, and `RUN`, an empty
//! archive for the metadata-only directives. Layers are cached under a key
//! chained from the previous step's key, so a hit guarantees the same
//! instruction was applied to the same state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use carte_common::config::RootStrategy;
use carte_common::constants::DEFAULT_PATH;
use carte_common::error::{CarteError, Result};
use carte_common::types::{ImageId, ImageRef, Sha256Hash};
use carte_core::namespace::NamespaceConfig;
use carte_core::spawn::{ProcessSpawner, SpawnRequest, StdioMode};

use crate::hash;
use crate::ignore::IgnoreRules;
use crate::layer::{self, Snapshot};
use crate::manifest::{Instruction, Manifest, Step};
use crate::package::{self, ImageConfig};
use crate::registry::{ImageCatalog, ImageEntry};
use crate::rootpath::{join_image_path, resolve_in_root};
use crate::storage::LayerStore;

/// A `RUN` command to execute inside the scratch root.
#[derive(Debug, Clone, Copy)]
pub struct RunStep<'a> {
    /// Host path of the scratch root.
    pub rootfs: &'a Path,
    /// Shell command text.
    pub command: &'a str,
    /// Accumulated environment.
    pub env: &'a [String],
    /// Image working directory.
    pub workdir: &'a str,
}

/// Executes `RUN` instructions.
pub trait InstructionExecutor: Send + Sync {
    /// Runs the command to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started or exits non-zero.
    fn run(&self, step: &RunStep<'_>) -> Result<()>;
}

/// Runs `/bin/sh -c <command>` through a namespaced process spawner.
pub struct SpawnExecutor {
    spawner: Arc<dyn ProcessSpawner>,
    namespaces: NamespaceConfig,
    root_strategy: RootStrategy,
}

impl SpawnExecutor {
    /// Creates an executor using `spawner` with the given isolation.
    #[must_use]
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        namespaces: NamespaceConfig,
        root_strategy: RootStrategy,
    ) -> Self {
        Self {
            spawner,
            namespaces,
            root_strategy,
        }
    }
}

impl fmt::Debug for SpawnExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnExecutor")
            .field("namespaces", &self.namespaces)
            .field("root_strategy", &self.root_strategy)
            .finish_non_exhaustive()
    }
}

impl InstructionExecutor for SpawnExecutor {
    fn run(&self, step: &RunStep<'_>) -> Result<()> {
        let mut env = step.env.to_vec();
        if !env.iter().any(|kv| kv.starts_with("PATH=")) {
            env.push(format!("PATH={DEFAULT_PATH}"));
        }
        let request = SpawnRequest {
            rootfs: step.rootfs.to_path_buf(),
            args: vec!["/bin/sh".into(), "-c".into(), step.command.to_string()],
            env,
            workdir: step.workdir.to_string(),
            hostname: "carte-build".into(),
            namespaces: self.namespaces,
            root_strategy: self.root_strategy,
            stdio: StdioMode::Inherit,
        };
        let process = self.spawner.spawn(&request)?.release()?;
        let outcome = process.wait()?;
        if !outcome.success() {
            return Err(CarteError::Process {
                message: format!("RUN `{}` exited with code {}", step.command, outcome.code()),
            });
        }
        Ok(())
    }
}

/// Whether a step ran or reused a cached layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction was applied and its layer stored.
    Executed,
    /// A cached layer was applied instead.
    Cached,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executed => write!(f, "executed"),
            Self::Cached => write!(f, "cached"),
        }
    }
}

/// Outcome of one build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Manifest line of the instruction.
    pub line: usize,
    /// Instruction text.
    pub instruction: String,
    /// Executed or cached.
    pub outcome: StepOutcome,
    /// Digest of the step's layer.
    pub layer: Sha256Hash,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Reference the image was registered under.
    pub image: ImageRef,
    /// Image ID.
    pub id: ImageId,
    /// Number of layers inherited from the base image.
    pub base_layers: usize,
    /// One report per instruction after `FROM`.
    pub steps: Vec<StepReport>,
}

impl BuildReport {
    /// Steps that executed.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome == StepOutcome::Executed).count()
    }

    /// Steps served from the cache.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome == StepOutcome::Cached).count()
    }
}

/// Builds images from manifests.
pub struct ImageBuilder {
    catalog: ImageCatalog,
    layers: LayerStore,
    tmp_dir: PathBuf,
    executor: Arc<dyn InstructionExecutor>,
}

impl fmt::Debug for ImageBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuilder")
            .field("catalog", &self.catalog)
            .field("layers", &self.layers)
            .field("tmp_dir", &self.tmp_dir)
            .finish_non_exhaustive()
    }
}

/// Mutable state threaded through the instruction loop.
struct BuildState<'a> {
    rootfs: PathBuf,
    work_dir: PathBuf,
    context: &'a Path,
    ignore: &'a IgnoreRules,
    config: ImageConfig,
}

impl ImageBuilder {
    /// Creates a builder over the given stores.
    #[must_use]
    pub fn new(
        catalog: ImageCatalog,
        layers: LayerStore,
        tmp_dir: impl Into<PathBuf>,
        executor: Arc<dyn InstructionExecutor>,
    ) -> Self {
        Self {
            catalog,
            layers,
            tmp_dir: tmp_dir.into(),
            executor,
        }
    }

    /// Builds `manifest_path` against `context_dir` and registers the result
    /// as `image`.
    ///
    /// Nothing is registered and no package is left behind unless every
    /// step succeeds. The scratch area is removed in all cases.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad manifests or missing base images,
    /// and the first step failure otherwise.
    pub fn build(&self, manifest_path: &Path, context_dir: &Path, image: &ImageRef) -> Result<BuildReport> {
        let manifest = Manifest::from_file(manifest_path)?;
        let context = context_dir
            .canonicalize()
            .map_err(|e| CarteError::io(context_dir, e))?;
        let ignore = IgnoreRules::load(&context)?;
        let base = self.catalog.get(&manifest.base)?;
        tracing::info!(image = %image, base = %manifest.base, steps = manifest.steps.len(), "building image");

        let scratch = ScratchDir::create(&self.tmp_dir)?;
        let (base_package, mut layer_tars) =
            package::unpack_layers(&base.package, &scratch.path().join("base"))?;
        let base_layers = layer_tars.len();

        let mut state = BuildState {
            rootfs: scratch.path().join("rootfs"),
            work_dir: scratch.path().join("layers"),
            context: &context,
            ignore: &ignore,
            config: base_package.config.config.clone(),
        };
        std::fs::create_dir_all(&state.rootfs).map_err(|e| CarteError::io(&state.rootfs, e))?;
        std::fs::create_dir_all(&state.work_dir).map_err(|e| CarteError::io(&state.work_dir, e))?;
        for tar_path in &layer_tars {
            let _ = layer::extract_layer(tar_path, &state.rootfs)?;
        }
        state.config.base_image = manifest.base.to_string();
        if state.config.workdir.is_empty() {
            state.config.workdir = "/".into();
        }

        let mut parent_key = base_package.id.as_str().to_string();
        let mut steps = Vec::with_capacity(manifest.steps.len());
        for (index, step) in manifest.steps.iter().enumerate() {
            let copy_digest = match &step.instruction {
                Instruction::Copy { src, .. } => {
                    Some(hash::hash_entries(&copy_sources(&context, &ignore, src)?)?)
                }
                _ => None,
            };
            let key = cache_key(&parent_key, &step.text, copy_digest.as_ref());

            let (cached, outcome) = if let Some(hit) = self.layers.lookup(key.as_hex())? {
                let _ = layer::extract_layer(&hit.path, &state.rootfs)?;
                (hit, StepOutcome::Cached)
            } else {
                let out = state.work_dir.join(format!("step-{index}.tar"));
                self.execute(step, &state, &out)
                    .map_err(|e| step_error(step, e))?;
                (self.layers.store(key.as_hex(), &step.text, &out)?, StepOutcome::Executed)
            };
            apply_metadata(&mut state.config, &step.instruction);

            tracing::info!(
                step = index + 1,
                line = step.line,
                instruction = %step.text,
                outcome = %outcome,
                "build step complete"
            );
            layer_tars.push(cached.path.clone());
            steps.push(StepReport {
                line: step.line,
                instruction: step.text.clone(),
                outcome,
                layer: cached.digest,
            });
            parent_key = key.as_hex().to_string();
        }

        let out = self.catalog.package_path(image);
        let written = package::write_package(&out, image, &state.config, &layer_tars)?;
        self.catalog.register(ImageEntry {
            id: written.id.clone(),
            name: image.name.clone(),
            tag: image.tag.clone(),
            layers: written.layers.iter().map(ToString::to_string).collect(),
            size_bytes: written.size_bytes,
            created_at: chrono::Utc::now().to_rfc3339(),
            package: out,
        })?;

        let report = BuildReport {
            image: image.clone(),
            id: written.id,
            base_layers,
            steps,
        };
        tracing::info!(
            image = %image,
            id = %report.id.short(),
            executed = report.executed(),
            cached = report.cached(),
            "image built"
        );
        Ok(report)
    }

    fn execute(&self, step: &Step, state: &BuildState<'_>, out: &Path) -> Result<()> {
        if step.instruction.is_metadata() {
            let _ = layer::write_empty(out)?;
            return Ok(());
        }

        let before = Snapshot::capture(&state.rootfs)?;
        match &step.instruction {
            Instruction::Workdir(path) => {
                let target = join_image_path(&state.config.workdir, path);
                let host = resolve_in_root(&state.rootfs, Path::new(&target))?;
                std::fs::create_dir_all(&host).map_err(|e| CarteError::io(&host, e))?;
            }
            Instruction::Copy { src, dst } => copy_into(state, src, dst)?,
            Instruction::Run(command) => self.executor.run(&RunStep {
                rootfs: &state.rootfs,
                command,
                env: &state.config.env_vars,
                workdir: &state.config.workdir,
            })?,
            Instruction::From(_)
            | Instruction::Env { .. }
            | Instruction::Entrypoint(_)
            | Instruction::Cmd(_)
            | Instruction::Expose(_) => {
                return Err(CarteError::validation(format!(
                    "{} cannot produce a filesystem layer",
                    step.instruction.keyword()
                )));
            }
        }
        let after = Snapshot::capture(&state.rootfs)?;
        let _ = layer::write_diff(&state.rootfs, &before, &after, out)?;
        Ok(())
    }
}

/// Chained cache key: the parent key, the instruction, and for `COPY` the
/// digest of the copied content.
#[must_use]
pub fn cache_key(parent: &str, instruction: &str, content: Option<&Sha256Hash>) -> Sha256Hash {
    let mut material = format!("{parent}\n{instruction}");
    if let Some(digest) = content {
        material.push('\n');
        material.push_str(digest.as_hex());
    }
    hash::hash_bytes(material.as_bytes())
}

fn apply_metadata(config: &mut ImageConfig, instruction: &Instruction) {
    match instruction {
        Instruction::Workdir(path) => config.workdir = join_image_path(&config.workdir, path),
        Instruction::Env { key, value } => config.set_env(key, value),
        Instruction::Entrypoint(args) => config.entrypoint.clone_from(args),
        Instruction::Cmd(args) => config.cmd.clone_from(args),
        Instruction::Expose(ports) => {
            for port in ports {
                if !config.exposed_ports.contains(port) {
                    config.exposed_ports.push(port.clone());
                }
            }
        }
        Instruction::From(_) | Instruction::Copy { .. } | Instruction::Run(_) => {}
    }
}

fn step_error(step: &Step, err: CarteError) -> CarteError {
    match err {
        CarteError::Validation { message } => CarteError::validation(format!("{step}: {message}")),
        other => other,
    }
}

/// Files selected by a `COPY` source, keyed by path relative to the source.
///
/// A file source yields a single entry keyed by its file name.
fn copy_sources(context: &Path, ignore: &IgnoreRules, src: &str) -> Result<BTreeMap<String, PathBuf>> {
    let joined = context.join(src.trim_start_matches('/'));
    let resolved = joined.canonicalize().map_err(|_| CarteError::NotFound {
        kind: "COPY source",
        id: src.to_string(),
    })?;
    if !resolved.starts_with(context) {
        return Err(CarteError::validation(format!(
            "COPY source '{src}' is outside the build context"
        )));
    }
    let rel_to_context = relative_str(&resolved, context);

    let mut entries = BTreeMap::new();
    if resolved.is_dir() {
        collect_dir(&resolved, Path::new(""), &rel_to_context, ignore, &mut entries)?;
    } else {
        if ignore.is_ignored(&rel_to_context) {
            return Err(CarteError::validation(format!(
                "COPY source '{src}' is excluded by .carteignore"
            )));
        }
        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _ = entries.insert(name, resolved);
    }
    Ok(entries)
}

fn collect_dir(
    root: &Path,
    rel: &Path,
    context_prefix: &str,
    ignore: &IgnoreRules,
    entries: &mut BTreeMap<String, PathBuf>,
) -> Result<()> {
    let dir = root.join(rel);
    let listing = std::fs::read_dir(&dir).map_err(|e| CarteError::io(&dir, e))?;
    for entry in listing {
        let entry = entry.map_err(|e| CarteError::io(&dir, e))?;
        let child = rel.join(entry.file_name());
        let child_str = child.to_string_lossy().into_owned();
        let context_rel = if context_prefix.is_empty() {
            child_str.clone()
        } else {
            format!("{context_prefix}/{child_str}")
        };
        if ignore.is_ignored(&context_rel) {
            continue;
        }
        let path = entry.path();
        let is_dir = std::fs::symlink_metadata(&path)
            .map_err(|e| CarteError::io(&path, e))?
            .is_dir();
        let _ = entries.insert(child_str, path);
        if is_dir {
            collect_dir(root, &child, context_prefix, ignore, entries)?;
        }
    }
    Ok(())
}

fn relative_str(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn copy_into(state: &BuildState<'_>, src: &str, dst: &str) -> Result<()> {
    let sources = copy_sources(state.context, state.ignore, src)?;
    let source_root = state.context.join(src.trim_start_matches('/'));
    let dst_image = join_image_path(&state.config.workdir, dst);
    let dst_host = resolve_in_root(&state.rootfs, Path::new(&dst_image))?;

    if !source_root.is_dir() {
        let Some((name, file)) = sources.into_iter().next() else {
            return Ok(());
        };
        let target = if dst.ends_with('/') || dst_host.is_dir() {
            resolve_in_root(&state.rootfs, Path::new(&join_image_path(&dst_image, &name)))?
        } else {
            dst_host
        };
        return copy_entry(&file, &target);
    }

    std::fs::create_dir_all(&dst_host).map_err(|e| CarteError::io(&dst_host, e))?;
    for (rel, file) in &sources {
        let target = resolve_in_root(&state.rootfs, Path::new(&join_image_path(&dst_image, rel)))?;
        copy_entry(file, &target)?;
    }
    tracing::debug!(src, dst = %dst_image, entries = sources.len(), "copied into image");
    Ok(())
}

fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(source).map_err(|e| CarteError::io(source, e))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CarteError::io(parent, e))?;
    }
    if meta.is_dir() {
        std::fs::create_dir_all(target).map_err(|e| CarteError::io(target, e))?;
        std::fs::set_permissions(target, meta.permissions()).map_err(|e| CarteError::io(target, e))
    } else if meta.file_type().is_symlink() {
        let link = std::fs::read_link(source).map_err(|e| CarteError::io(source, e))?;
        if std::fs::symlink_metadata(target).is_ok() {
            std::fs::remove_file(target).map_err(|e| CarteError::io(target, e))?;
        }
        std::os::unix::fs::symlink(&link, target).map_err(|e| CarteError::io(target, e))
    } else {
        std::fs::copy(source, target)
            .map(|_| ())
            .map_err(|e| CarteError::io(target, e))
    }
}

/// A scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create(tmp_dir: &Path) -> Result<Self> {
        let path = tmp_dir.join(format!("build-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path).map_err(|e| CarteError::io(&path, e))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            tracing::warn!(path = %self.0.display(), error = %e, "failed to remove build scratch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_chains_parent() {
        let a = cache_key("base", "RUN echo hi", None);
        let b = cache_key("other", "RUN echo hi", None);
        assert_ne!(a, b);
        assert_eq!(a, cache_key("base", "RUN echo hi", None));
    }

    #[test]
    fn cache_key_includes_copy_content() {
        let one = hash::hash_bytes(b"one");
        let two = hash::hash_bytes(b"two");
        assert_ne!(
            cache_key("p", "COPY a /a", Some(&one)),
            cache_key("p", "COPY a /a", Some(&two))
        );
    }

    #[test]
    fn metadata_accumulates_into_config() {
        let mut config = ImageConfig {
            workdir: "/".into(),
            ..ImageConfig::default()
        };
        apply_metadata(&mut config, &Instruction::Workdir("app".into()));
        apply_metadata(&mut config, &Instruction::Workdir("src".into()));
        apply_metadata(&mut config, &Instruction::Env { key: "X".into(), value: "1".into() });
        apply_metadata(&mut config, &Instruction::Expose(vec!["80".into()]));
        apply_metadata(&mut config, &Instruction::Expose(vec!["80".into(), "443".into()]));
        assert_eq!(config.workdir, "/app/src");
        assert_eq!(config.env_vars, ["X=1"]);
        assert_eq!(config.exposed_ports, ["80", "443"]);
    }

    #[test]
    fn copy_sources_honor_ignore_rules() {
        let ctx = tempfile::tempdir().unwrap();
        let root = ctx.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src/target")).unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("src/target/out.o"), "obj").unwrap();
        let ignore = IgnoreRules::parse("src/target\n");

        let entries = copy_sources(&root, &ignore, "src").unwrap();
        let keys: Vec<_> = entries.keys().cloned().collect();
        assert_eq!(keys, ["main.rs"]);
    }

    #[test]
    fn copy_sources_reject_escapes() {
        let ctx = tempfile::tempdir().unwrap();
        let root = ctx.path().join("ctx");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(ctx.path().join("secret"), "x").unwrap();
        let root = root.canonicalize().unwrap();
        let err = copy_sources(&root, &IgnoreRules::default(), "../secret").unwrap_err();
        assert!(err.is_validation());
    }
}
