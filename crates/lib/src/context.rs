//! The build context threaded through every phase of every action.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use osbake_blockdev::LoopbackDevice;

/// Origin name of the directory holding the current recipe.
pub(crate) const ORIGIN_RECIPE: &str = "recipe";
/// Origin name of the current target root.
pub(crate) const ORIGIN_FILESYSTEM: &str = "filesystem";
/// Origin name of the artifact output directory.
pub(crate) const ORIGIN_ARTIFACTS: &str = "artifacts";

const RESERVED_ORIGINS: &[&str] = &[ORIGIN_RECIPE, ORIGIN_FILESYSTEM, ORIGIN_ARTIFACTS];

/// Outcome of the build so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildState {
    #[default]
    Success,
    Failed,
}

/// A partition of the assembled image and the device node it is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImagePartition {
    pub(crate) name: String,
    pub(crate) device_path: Utf8PathBuf,
}

/// A recorded acquisition of a resource which must be released later,
/// possibly by a different phase than the one which acquired it.
#[derive(Debug)]
pub(crate) enum ResourceToken {
    /// A loop device backing the image file.
    Loopback(LoopbackDevice),
    /// A filesystem mounted at this path.
    Mount(Utf8PathBuf),
}

/// The part of the context which is private to a (sub-)recipe.
#[derive(Debug, Clone)]
pub(crate) struct RecipeScope {
    pub(crate) recipe_dir: Utf8PathBuf,
    pub(crate) architecture: String,
    origins: BTreeMap<String, Utf8PathBuf>,
}

impl RecipeScope {
    pub(crate) fn new(recipe_dir: Utf8PathBuf, architecture: String) -> Self {
        Self {
            recipe_dir,
            architecture,
            origins: BTreeMap::new(),
        }
    }

    /// A scope for an included recipe; origins start out as a copy of ours.
    pub(crate) fn nested(&self, recipe_dir: Utf8PathBuf) -> Self {
        Self {
            recipe_dir,
            architecture: self.architecture.clone(),
            origins: self.origins.clone(),
        }
    }
}

/// Mutable state of a build.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) scratchdir: Utf8PathBuf,
    pub(crate) rootdir: Utf8PathBuf,
    pub(crate) artifactdir: Utf8PathBuf,
    /// Backing file or block device of the image; unset until an image is created.
    pub(crate) image: Option<Utf8PathBuf>,
    /// All partitions of the image are mounted below this directory.
    pub(crate) image_mntdir: Utf8PathBuf,
    pub(crate) image_fstab: String,
    pub(crate) image_kernel_root: String,
    pub(crate) scope: RecipeScope,
    pub(crate) environ_vars: BTreeMap<String, String>,
    pub(crate) verbose: bool,
    pub(crate) debug_shell: Option<Utf8PathBuf>,
    image_partitions: Vec<ImagePartition>,
    state: BuildState,
    resources: Vec<ResourceToken>,
}

impl Context {
    pub(crate) fn new(
        scratchdir: Utf8PathBuf,
        artifactdir: Utf8PathBuf,
        recipe_dir: Utf8PathBuf,
        architecture: String,
    ) -> Self {
        Self {
            rootdir: scratchdir.join("root"),
            image_mntdir: scratchdir.join("mnt"),
            scratchdir,
            artifactdir,
            image: None,
            image_fstab: String::new(),
            image_kernel_root: String::new(),
            scope: RecipeScope::new(recipe_dir, architecture),
            environ_vars: BTreeMap::new(),
            verbose: false,
            debug_shell: None,
            image_partitions: Vec::new(),
            state: BuildState::Success,
            resources: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> BuildState {
        self.state
    }

    /// Record that the build failed; this is never undone.
    pub(crate) fn mark_failed(&mut self) {
        self.state = BuildState::Failed;
    }

    /// Look up an origin by name. The reserved names always resolve to the
    /// current recipe directory, root directory and artifact directory.
    pub(crate) fn origin(&self, name: &str) -> Option<&Utf8Path> {
        match name {
            ORIGIN_RECIPE => Some(&self.scope.recipe_dir),
            ORIGIN_FILESYSTEM => Some(&self.rootdir),
            ORIGIN_ARTIFACTS => Some(&self.artifactdir),
            o => self.scope.origins.get(o).map(|p| p.as_path()),
        }
    }

    pub(crate) fn require_origin(&self, name: &str) -> Result<&Utf8Path> {
        self.origin(name)
            .ok_or_else(|| anyhow!("Origin {name} not found"))
    }

    /// Register a new origin, e.g. one given with `--origin`; origins can't
    /// be overwritten.
    pub(crate) fn insert_origin(&mut self, name: &str, path: Utf8PathBuf) -> Result<()> {
        if RESERVED_ORIGINS.contains(&name) {
            anyhow::bail!("Origin name {name} is reserved");
        }
        if self.scope.origins.contains_key(name) {
            anyhow::bail!("Origin {name} already exists");
        }
        tracing::debug!("New origin {name}: {path}");
        self.scope.origins.insert(name.to_owned(), path);
        Ok(())
    }

    pub(crate) fn image_partitions(&self) -> &[ImagePartition] {
        &self.image_partitions
    }

    /// Record the partitions of the image; this can only happen once.
    pub(crate) fn set_image_partitions(&mut self, parts: Vec<ImagePartition>) -> Result<()> {
        if !self.image_partitions.is_empty() {
            anyhow::bail!("Image partitions were already set up");
        }
        self.image_partitions = parts;
        Ok(())
    }

    pub(crate) fn partition_device(&self, name: &str) -> Option<&Utf8Path> {
        self.image_partitions
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.device_path.as_path())
    }

    pub(crate) fn push_resource(&mut self, token: ResourceToken) {
        tracing::trace!("Acquired {token:?}");
        self.resources.push(token);
    }

    /// Remove and return all resource tokens matching `pred`, most recently
    /// acquired first.
    pub(crate) fn take_resources(
        &mut self,
        pred: impl Fn(&ResourceToken) -> bool,
    ) -> Vec<ResourceToken> {
        let (mut taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.resources).into_iter().partition(|t| pred(t));
        self.resources = kept;
        taken.reverse();
        taken
    }

    /// Run `f` with `scope` swapped in as the recipe scope.
    pub(crate) fn with_scope<R>(
        &mut self,
        scope: &mut RecipeScope,
        f: impl FnOnce(&mut Context) -> R,
    ) -> R {
        std::mem::swap(&mut self.scope, scope);
        let r = f(self);
        std::mem::swap(&mut self.scope, scope);
        r
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A context rooted in a temporary directory.
    pub(crate) fn test_context(td: &tempfile::TempDir) -> Context {
        let base = Utf8Path::from_path(td.path()).unwrap();
        let scratch = base.join("scratch");
        let artifacts = base.join("artifacts");
        let recipe = base.join("recipe");
        for d in [&scratch, &artifacts, &recipe] {
            std::fs::create_dir_all(d).unwrap();
        }
        let ctx = Context::new(scratch, artifacts, recipe, "amd64".into());
        std::fs::create_dir_all(&ctx.rootdir).unwrap();
        std::fs::create_dir_all(&ctx.image_mntdir).unwrap();
        ctx
    }

    #[test]
    fn test_reserved_origins() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        assert_eq!(ctx.origin("recipe").unwrap(), ctx.scope.recipe_dir);
        assert_eq!(ctx.origin("artifacts").unwrap(), ctx.artifactdir);
        assert_eq!(ctx.origin("filesystem").unwrap(), ctx.rootdir);
        // The filesystem origin follows the root directory
        ctx.rootdir = ctx.image_mntdir.clone();
        assert_eq!(ctx.origin("filesystem").unwrap(), ctx.image_mntdir);
        assert!(ctx.insert_origin("recipe", "/foo".into()).is_err());
        assert!(ctx.origin("unknown").is_none());
        assert!(ctx.require_origin("unknown").is_err());
        Ok(())
    }

    #[test]
    fn test_origins_append_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        ctx.insert_origin("firmware", "/srv/firmware".into())?;
        assert_eq!(ctx.origin("firmware").unwrap(), "/srv/firmware");
        assert!(ctx.insert_origin("firmware", "/other".into()).is_err());
        Ok(())
    }

    #[test]
    fn test_nested_scope() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        ctx.insert_origin("parent", "/parent".into())?;
        let mut nested = ctx.scope.nested("/recipes/sub".into());
        ctx.with_scope(&mut nested, |ctx| -> Result<()> {
            assert_eq!(ctx.origin("recipe").unwrap(), "/recipes/sub");
            assert_eq!(ctx.origin("parent").unwrap(), "/parent");
            ctx.insert_origin("child", "/child".into())?;
            ctx.image_kernel_root = "root=UUID=1234".into();
            Ok(())
        })?;
        // Origins stay scoped, the rest is shared
        assert!(ctx.origin("child").is_none());
        assert_eq!(ctx.origin("recipe").unwrap(), ctx.scope.recipe_dir);
        assert_eq!(ctx.image_kernel_root, "root=UUID=1234");
        Ok(())
    }

    #[test]
    fn test_image_partitions_once() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let parts = vec![ImagePartition {
            name: "root".into(),
            device_path: "/dev/loop0p1".into(),
        }];
        ctx.set_image_partitions(parts.clone())?;
        assert_eq!(ctx.partition_device("root").unwrap(), "/dev/loop0p1");
        assert!(ctx.partition_device("boot").is_none());
        assert!(ctx.set_image_partitions(parts).is_err());
        Ok(())
    }

    #[test]
    fn test_take_resources() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        for p in ["/mnt", "/mnt/boot", "/mnt/boot/efi"] {
            ctx.push_resource(ResourceToken::Mount(p.into()));
        }
        let taken = ctx.take_resources(|t| matches!(t, ResourceToken::Mount(_)));
        let paths: Vec<_> = taken
            .iter()
            .map(|t| match t {
                ResourceToken::Mount(p) => p.as_str(),
                ResourceToken::Loopback(_) => unreachable!(),
            })
            .collect();
        assert_eq!(paths, ["/mnt/boot/efi", "/mnt/boot", "/mnt"]);
        assert!(ctx
            .take_resources(|t| matches!(t, ResourceToken::Mount(_)))
            .is_empty());
        Ok(())
    }
}
